//! Event loop and device plumbing driven over real sockets and pipes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use hio::sck::{DevSck, SckBind, SckCbs, SckConnect, SckListen, SckMake, SckType};
use hio::{Hio, SkAd, StopReason};

mod util;
use util::init;

#[test]
fn timer_jobs_fire_in_deadline_order() {
    init();
    let hio = Hio::open(64).unwrap();
    let fired: Rc<RefCell<Vec<u32>>> = Rc::new(RefCell::new(Vec::new()));

    for (delay_ms, tag) in [(30u64, 3u32), (10, 1), (20, 2)] {
        let fired = fired.clone();
        let idx = hio::new_tmridx();
        hio.sched_tmrjob_after(
            Duration::from_millis(delay_ms),
            &idx,
            Box::new(move |hio, _now| {
                fired.borrow_mut().push(tag);
                if tag == 3 {
                    hio.stop(StopReason::Demand);
                }
            }),
        )
        .unwrap();
    }

    assert_eq!(hio.run().unwrap(), StopReason::Demand);
    assert_eq!(*fired.borrow(), vec![1, 2, 3]);
}

#[test]
fn cancelled_timer_does_not_fire() {
    init();
    let hio = Hio::open(64).unwrap();
    let fired = Rc::new(Cell::new(false));

    let idx = hio::new_tmridx();
    {
        let fired = fired.clone();
        hio.sched_tmrjob_after(
            Duration::from_millis(5),
            &idx,
            Box::new(move |_hio, _now| fired.set(true)),
        )
        .unwrap();
    }
    assert!(hio.del_tmrjob(&idx));
    assert_eq!(idx.get(), hio::TMRIDX_INVALID);

    let deadline = Instant::now() + Duration::from_millis(50);
    while Instant::now() < deadline {
        hio.run_once(Some(Duration::from_millis(10))).unwrap();
    }
    assert!(!fired.get());
}

#[test]
fn tcp_echo_between_two_devices() {
    init();
    let hio = Hio::open(64).unwrap();

    // Server side: echo whatever arrives back to the sender and halt on
    // EOF.
    let lsck = DevSck::make(
        &hio,
        SckMake {
            typ: SckType::Tcp4,
            options: 0,
            cbs: SckCbs {
                on_read: Rc::new(|sck, res, _src| {
                    let data = res?;
                    if data.is_empty() {
                        sck.halt();
                    } else {
                        sck.write(data, 0, None)?;
                    }
                    Ok(())
                }),
                ..Default::default()
            },
        },
    )
    .unwrap();
    lsck.bind(&SckBind {
        addr: Some(SkAd::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap())),
        reuseaddr: true,
        ..Default::default()
    })
    .unwrap();
    lsck.listen(&SckListen {
        backlogs: 16,
        accept_tmout: None,
    })
    .unwrap();
    let addr = lsck.getsockaddr().unwrap();

    // Client side: once connected, send a probe and collect the echo.
    let echoed: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let done = Rc::new(Cell::new(false));
    let csck = DevSck::make(
        &hio,
        SckMake {
            typ: SckType::Tcp4,
            options: 0,
            cbs: SckCbs {
                on_connect: Rc::new(|sck| {
                    sck.write(b"ping over the loop", 7, None).unwrap();
                }),
                on_read: {
                    let echoed = echoed.clone();
                    let done = done.clone();
                    Rc::new(move |sck, res, _src| {
                        let data = res?;
                        echoed.borrow_mut().extend_from_slice(data);
                        if echoed.borrow().len() >= 18 {
                            done.set(true);
                            sck.halt();
                        }
                        Ok(())
                    })
                },
                on_write: Rc::new(|_sck, res, wrctx| {
                    assert_eq!(wrctx, 7);
                    assert_eq!(res.unwrap(), 18);
                    Ok(())
                }),
                ..Default::default()
            },
        },
    )
    .unwrap();
    csck.connect(&SckConnect {
        addr,
        connect_tmout: Some(Duration::from_secs(5)),
    })
    .unwrap();

    util::serve_until(&hio, || done.get());
    assert_eq!(&*echoed.borrow(), b"ping over the loop");
    hio.close();
}

#[test]
fn timed_read_delivers_timeout() {
    init();
    let hio = Hio::open(64).unwrap();

    let lsck = DevSck::make(
        &hio,
        SckMake {
            typ: SckType::Tcp4,
            options: 0,
            cbs: SckCbs::default(),
        },
    )
    .unwrap();
    lsck.bind(&SckBind {
        addr: Some(SkAd::from("127.0.0.1:0".parse::<std::net::SocketAddr>().unwrap())),
        reuseaddr: true,
        ..Default::default()
    })
    .unwrap();
    lsck.listen(&SckListen {
        backlogs: 16,
        accept_tmout: None,
    })
    .unwrap();
    let addr = lsck.getsockaddr().unwrap().to_socket_addr().unwrap();

    // A peer that connects and stays silent.
    let _peer = std::net::TcpStream::connect(addr).unwrap();

    let timed_out = Rc::new(Cell::new(false));
    let csck = DevSck::make(
        &hio,
        SckMake {
            typ: SckType::Tcp4,
            options: 0,
            cbs: SckCbs {
                on_read: {
                    let timed_out = timed_out.clone();
                    Rc::new(move |_sck, res, _src| {
                        match res {
                            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                                timed_out.set(true);
                            }
                            Err(e) => panic!("unexpected read failure: {}", e),
                            Ok(data) => panic!("unexpected data: {} bytes", data.len()),
                        }
                        Ok(())
                    })
                },
                ..Default::default()
            },
        },
    )
    .unwrap();
    csck.connect(&SckConnect {
        addr: SkAd::from(addr),
        connect_tmout: None,
    })
    .unwrap();
    csck.timedread(true, Duration::from_millis(50)).unwrap();

    util::serve_until(&hio, || timed_out.get());
    hio.close();
}

#[test]
fn qx_side_channel_reaches_the_loop() {
    init();
    let hio = Hio::open(64).unwrap();

    let got: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
    let qx = DevSck::make(
        &hio,
        SckMake {
            typ: SckType::Qx,
            options: 0,
            cbs: SckCbs {
                on_read: {
                    let got = got.clone();
                    Rc::new(move |_sck, res, _src| {
                        got.borrow_mut().extend_from_slice(res?);
                        Ok(())
                    })
                },
                ..Default::default()
            },
        },
    )
    .unwrap();

    let handle = qx.side_chan_handle().unwrap();
    let writer = std::thread::spawn(move || {
        handle.write(b"crosses threads").unwrap();
    });
    writer.join().unwrap();

    util::serve_until(&hio, || got.borrow().len() >= 15);
    assert_eq!(&*got.borrow(), b"crosses threads");
    hio.close();
}
