use std::rc::Rc;

/// A long-lived owner of a device graph, registered with the loop.
///
/// Services are stopped in reverse start order when the loop closes; a
/// stopped service must kill every device it owns.
pub trait Svc {
    fn svc_stop(self: Rc<Self>);
}
