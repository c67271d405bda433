use crate::error::XhciError;

/// Controller-level callbacks the ring engine raises.
///
/// Implemented by whatever owns the controller (the device driver proper). Calls arrive on the
/// interrupt service thread, never with a ring lock held.
pub trait HostController: Send + Sync {
    /// A continuation resolved with a hardware-fatal status. The controller must halt and fail
    /// every outstanding request.
    fn shutdown(&self, reason: XhciError);

    /// The service thread of interrupter `index` has returned.
    fn interrupter_exited(&self, _index: u16) {}

    /// The controller posted a Port Status Change Event for root hub port `port` (1-based).
    fn port_status_changed(&self, _port: u8) {}
}
