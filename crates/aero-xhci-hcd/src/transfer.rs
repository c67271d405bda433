//! Building transfer descriptors for USB requests.
//!
//! Every builder follows the same publication protocol: the first TRB of the transaction is
//! reserved with [`TransferRing::allocate_trb`] (stale cycle bit, so the controller stops in front
//! of it), the remaining TRBs are written live, and the first TRB is published last. The doorbell
//! is rung only after the ring locks are released.
//!
//! Errors are reported twice: to the request's completion callback and to the caller.

use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::context::TrbContext;
use crate::error::{Result, XhciError};
use crate::regs::Doorbells;
use crate::request::UsbRequest;
use crate::transfer_ring::{RingState, TransferRing};
use crate::trb::{TransferType, Trb, TrbFlags};

/// Doorbell target of the default control endpoint (DCI 1).
const CONTROL_ENDPOINT_TARGET: u8 = 1;

/// Largest transfer length one TRB can describe.
const MAX_TRB_LENGTH: u64 = 0x1_0000;

/// Splits a request buffer into (bus address, length) pieces that never cross a page boundary.
pub fn page_chunks(phys_list: &[u64], length: u64, page_size: usize) -> Result<Vec<(u64, u32)>> {
    if page_size == 0 {
        return Err(XhciError::NotSupported("zero page size"));
    }
    let page_size = page_size as u64;
    let mut chunks = Vec::new();
    let mut remaining = length;
    for &phys in phys_list {
        if remaining == 0 {
            break;
        }
        let in_page = page_size - (phys % page_size);
        let len = remaining.min(in_page).min(MAX_TRB_LENGTH);
        chunks.push((phys, len as u32));
        remaining -= len;
    }
    if remaining != 0 {
        return Err(XhciError::NotSupported("request buffer shorter than its length"));
    }
    Ok(chunks)
}

fn data_flags(config: &TransferConfig) -> TrbFlags {
    if config.no_snoop {
        TrbFlags::NO_SNOOP
    } else {
        TrbFlags::empty()
    }
}

/// Rolls the producer back to `start` after a failed transaction. Everything the transaction
/// wrote is taken back from hardware, and a context it already queued is failed with `err`.
fn abort(ring: &TransferRing, start: &RingState, err: XhciError) -> XhciError {
    match ring.rollback(start, err.clone()) {
        Ok(()) => warn!(token = ring.token(), %err, "transaction rolled back"),
        Err(rollback) => warn!(token = ring.token(), %err, %rollback, "transaction not rolled back"),
    }
    err
}

/// Queues a control transfer (Setup, optional Data, Status) on the default control endpoint of
/// `slot` and rings its doorbell.
pub fn queue_control(
    ring: &TransferRing,
    request: UsbRequest,
    config: &TransferConfig,
    doorbells: &Doorbells,
    slot: u8,
) -> Result<()> {
    let Some(setup) = request.setup else {
        let err = XhciError::NotSupported("control request without a setup packet");
        request.fail(err.clone());
        return Err(err);
    };
    let chunks = match page_chunks(&request.phys_list, request.length, config.page_size) {
        Ok(chunks) => chunks,
        Err(err) => {
            request.fail(err.clone());
            return Err(err);
        }
    };
    let direction_in = setup.is_device_to_host();
    let transfer_type = match (chunks.is_empty(), direction_in) {
        (true, _) => TransferType::NoData,
        (false, true) => TransferType::In,
        (false, false) => TransferType::Out,
    };
    let token = ring.token();

    let producer = ring.lock_producer();
    let start = ring.save_state();
    let (setup_trb, setup_state) = match ring.allocate_trb() {
        Ok(reserved) => reserved,
        Err(err) => {
            request.fail(err.clone());
            return Err(err);
        }
    };

    let count = chunks.len();
    for (i, &(phys, len)) in chunks.iter().enumerate() {
        let mut flags = data_flags(config);
        flags.set(TrbFlags::CHAIN, i + 1 < count);
        let td_size = (count - i - 1) as u32;
        let trb = if i == 0 {
            flags.set(TrbFlags::DIR_IN, direction_in);
            Trb::data_stage(phys, len, td_size, config.interrupter, flags)
        } else {
            Trb::normal(phys, len, td_size, config.interrupter, flags)
        };
        if let Err(err) = ring.add_trb(&trb, None) {
            let err = abort(ring, &start, err);
            request.fail(err.clone());
            return Err(err);
        }
    }

    // The status stage runs opposite to the data stage; with no data stage it is IN.
    let status_in = !(direction_in && count > 0);
    let status = Trb::status_stage(status_in, config.interrupter);
    let context = TrbContext::for_request(token, request).starting_at(setup_trb);
    if let Err(err) = ring.add_trb(&status, Some(context)) {
        return Err(abort(ring, &start, err));
    }

    let setup_stage = Trb::setup_stage(&setup, transfer_type, config.interrupter);
    if let Err(err) = ring.publish_trb(setup_trb, &setup_stage, &setup_state) {
        return Err(abort(ring, &start, err));
    }
    ring.commit_transaction(&start);
    drop(producer);

    debug!(
        slot,
        endpoint = CONTROL_ENDPOINT_TARGET,
        token,
        phys = ring.phys(setup_trb).unwrap_or_default(),
        "control transfer queued"
    );
    doorbells.ring(slot, CONTROL_ENDPOINT_TARGET, 0);
    Ok(())
}

/// Queues a bulk or interrupt transfer as one Normal TRB per page and rings the endpoint's
/// doorbell.
///
/// All TRBs but the last chain to the next one and interrupt on short packets; the last
/// interrupts on completion. TD size counts the TRBs still to come.
pub fn queue_normal(
    ring: &TransferRing,
    request: UsbRequest,
    config: &TransferConfig,
    doorbells: &Doorbells,
    slot: u8,
) -> Result<()> {
    let mut chunks = match page_chunks(&request.phys_list, request.length, config.page_size) {
        Ok(chunks) => chunks,
        Err(err) => {
            request.fail(err.clone());
            return Err(err);
        }
    };
    if chunks.is_empty() {
        // Zero-length packet.
        chunks.push((0, 0));
    }
    let target = request.endpoint_dci();
    let token = ring.token();
    let count = chunks.len();

    let trb_at = |i: usize| {
        let (phys, len) = chunks[i];
        let mut flags = data_flags(config);
        if i + 1 < count {
            flags |= TrbFlags::CHAIN | TrbFlags::ISP;
        } else {
            flags |= TrbFlags::IOC;
        }
        Trb::normal(phys, len, (count - i - 1) as u32, config.interrupter, flags)
    };

    let producer = ring.lock_producer();
    let start = ring.save_state();
    let (first, first_state) = match ring.allocate_trb() {
        Ok(reserved) => reserved,
        Err(err) => {
            request.fail(err.clone());
            return Err(err);
        }
    };

    if count == 1 {
        let context = TrbContext::for_request(token, request);
        if let Err(err) = ring.assign_context(first, context, first) {
            return Err(abort(ring, &start, err));
        }
    } else {
        let mut request = Some(request);
        for i in 1..count {
            let context = if i + 1 == count {
                request
                    .take()
                    .map(|request| TrbContext::for_request(token, request).starting_at(first))
            } else {
                None
            };
            if let Err(err) = ring.add_trb(&trb_at(i), context) {
                let err = abort(ring, &start, err);
                if let Some(request) = request.take() {
                    request.fail(err.clone());
                }
                return Err(err);
            }
        }
    }

    if let Err(err) = ring.publish_trb(first, &trb_at(0), &first_state) {
        return Err(abort(ring, &start, err));
    }
    ring.commit_transaction(&start);
    drop(producer);

    debug!(
        slot,
        endpoint = target,
        token,
        trbs = count,
        "normal transfer queued"
    );
    doorbells.ring(slot, target, 0);
    Ok(())
}
