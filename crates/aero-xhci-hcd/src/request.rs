//! Software transfer requests as submitted by the USB bus layer.

use std::fmt;

use crate::error::{Result, XhciError};

/// Bit 7 of `bmRequestType`: device-to-host.
pub const USB_DIR_IN: u8 = 0x80;
/// Bit 7 of an endpoint address: IN endpoint.
pub const USB_ENDPOINT_DIR_IN: u8 = 0x80;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(&self) -> bool {
        (self.bm_request_type & USB_DIR_IN) != 0
    }

    /// The packet as the little-endian immediate-data parameter of a Setup Stage TRB.
    pub fn to_parameter(&self) -> u64 {
        u64::from(self.bm_request_type)
            | (u64::from(self.b_request) << 8)
            | (u64::from(self.w_value) << 16)
            | (u64::from(self.w_index) << 32)
            | (u64::from(self.w_length) << 48)
    }
}

/// Outcome delivered to a request's completion callback.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Bytes actually transferred, or the error that completed the request.
    pub status: Result<usize>,
}

pub type RequestCallback = Box<dyn FnOnce(UsbRequest, RequestOutcome) + Send + 'static>;

/// A transfer request bound for one endpoint of one device.
///
/// `phys_list` holds the bus address of every page backing the data buffer, in order. The page
/// size is the controller's (see [`crate::config::RingParams::page_size`]).
pub struct UsbRequest {
    pub device_id: u32,
    /// USB endpoint address (bit 7 set for IN endpoints, 0 for the default control pipe).
    pub endpoint: u8,
    pub setup: Option<SetupPacket>,
    /// Requested data length in bytes.
    pub length: u64,
    pub phys_list: Vec<u64>,
    callback: Option<RequestCallback>,
}

impl fmt::Debug for UsbRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbRequest")
            .field("device_id", &self.device_id)
            .field("endpoint", &self.endpoint)
            .field("setup", &self.setup)
            .field("length", &self.length)
            .field("phys_list", &self.phys_list)
            .finish_non_exhaustive()
    }
}

impl UsbRequest {
    pub fn new(
        device_id: u32,
        endpoint: u8,
        length: u64,
        phys_list: Vec<u64>,
        callback: impl FnOnce(UsbRequest, RequestOutcome) + Send + 'static,
    ) -> Self {
        Self {
            device_id,
            endpoint,
            setup: None,
            length,
            phys_list,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn with_setup(mut self, setup: SetupPacket) -> Self {
        self.setup = Some(setup);
        self
    }

    pub fn is_control(&self) -> bool {
        self.endpoint & !USB_ENDPOINT_DIR_IN == 0
    }

    pub fn is_in(&self) -> bool {
        match self.setup {
            Some(setup) if self.is_control() => setup.is_device_to_host(),
            _ => self.endpoint & USB_ENDPOINT_DIR_IN != 0,
        }
    }

    /// Device Context Index of the target endpoint (the doorbell target).
    pub fn endpoint_dci(&self) -> u8 {
        let number = self.endpoint & 0x0f;
        if number == 0 {
            return 1;
        }
        number * 2 + u8::from(self.endpoint & USB_ENDPOINT_DIR_IN != 0)
    }

    /// Runs the completion callback. Completing twice is a no-op.
    pub fn complete(mut self, status: Result<usize>) {
        if let Some(callback) = self.callback.take() {
            callback(self, RequestOutcome { status });
        }
    }

    pub fn fail(self, err: XhciError) {
        self.complete(Err(err));
    }
}
