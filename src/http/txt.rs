//! The text task: a synthesized response from a status code and an
//! optional body. Any request body is consumed and discarded.

use std::io;
use std::rc::Rc;

use log::debug;

use crate::http::htre::{Htre, ATTR_EXPECT, ATTR_EXPECT100};
use crate::http::svr::{Cli, Htts};
use crate::http::task::{
    bind_task, halt_participating_devices, mark_over, Task, TaskCore, OVER_READ_FROM_PEER,
    OVER_WRITE_TO_PEER,
};
use crate::http::status;

struct TxtTask {
    core: TaskCore,
}

impl Task for TxtTask {
    fn core(&self) -> &TaskCore {
        &self.core
    }

    // No peer: the defaults cover everything, and request body fragments
    // fall into the default discarding `on_client_body`.
}

impl Htts {
    /// Responds to the request with a synthesized message.
    pub fn dotxt(
        self: &Rc<Self>,
        cli: &Rc<Cli>,
        req: &Htre,
        status_code: u16,
        content_type: Option<&str>,
        content_text: Option<&str>,
    ) -> io::Result<()> {
        if cli.task().is_some() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "duplicate task request prohibited",
            ));
        }
        let task: Rc<dyn Task> = Rc::new(TxtTask {
            core: TaskCore::new(self, cli, req),
        });

        let r = (|| -> io::Result<()> {
            // There is no peer side; both peer flows are over from the
            // start.
            mark_over(&task, OVER_READ_FROM_PEER | OVER_WRITE_TO_PEER);
            bind_task(self, cli, &task)?;

            if req.flags() & ATTR_EXPECT100 != 0 {
                // Don't solicit the body; whatever arrives is discarded.
            } else if req.flags() & ATTR_EXPECT != 0 {
                task.core()
                    .sendfinalres(status::EXPECTATION_FAILED, None, None, true)?;
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unsupported expectation",
                ));
            }

            task.core()
                .sendfinalres(status_code, content_type, content_text, false)
        })();

        if let Err(e) = r {
            debug!("text task setup failed: {}", e);
            halt_participating_devices(&task);
            return Err(e);
        }
        Ok(())
    }
}
