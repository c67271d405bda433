use std::sync::{Arc, Mutex};

use aero_xhci_hcd::regs::Iman;
use aero_xhci_hcd::{
    enumerate_device, CompletionCode, DeviceContexts, HubInfo, Interrupter, Result, Trb, TrbType,
    XhciError,
};
use futures::FutureExt;

mod util;

use util::{FakeInterrupt, Harness, RTSOFF};

const IMAN: u64 = RTSOFF as u64 + 0x20;

#[derive(Default)]
struct FakeDeviceContexts {
    prepared: Mutex<Vec<(u8, u8, Option<HubInfo>)>>,
    fail: bool,
}

impl DeviceContexts for FakeDeviceContexts {
    fn prepare_address_device(&self, slot: u8, port: u8, hub: Option<HubInfo>) -> Result<u64> {
        self.prepared.lock().unwrap().push((slot, port, hub));
        if self.fail {
            return Err(XhciError::OutOfMemory);
        }
        Ok(0x7_0000)
    }
}

fn command_base(h: &Harness) -> u64 {
    h.command_ring.crcr().unwrap().pointer()
}

#[test]
fn crcr_points_at_the_first_command_with_rcs_set() {
    let h = Harness::new();
    let crcr = h.command_ring.crcr().unwrap();
    assert!(crcr.rcs());
    assert_eq!(
        crcr.pointer(),
        h.command_ring.ring().dequeue_pointer().unwrap() & !0xf
    );
}

#[test]
fn submitted_command_rings_doorbell_zero_and_resolves_on_completion() {
    let mut h = Harness::new();
    let base = command_base(&h);
    let future = h.command_ring.submit(&Trb::noop_command()).unwrap();

    let queued = h.dma.mem.read_trb(base);
    assert!(queued.cycle());
    assert_eq!(queued.trb_type(), TrbType::NoOpCommand);
    assert_eq!(h.mmio.doorbells(), vec![(0, 0)]);

    let result = h.event_ring.schedule_task(future);
    let event = Trb::command_completion_event(base, CompletionCode::Success, 0);
    h.hw.post(event);
    assert_eq!(h.event_ring.handle_irq(), 1);

    let resolved = result.now_or_never().unwrap().unwrap();
    assert_eq!(resolved.trb_type(), TrbType::CommandCompletionEvent);
    assert_eq!(resolved.parameter, base);
}

#[test]
fn failed_command_resolves_with_its_completion_code() {
    let mut h = Harness::new();
    let base = command_base(&h);
    let result = h
        .event_ring
        .schedule_task(h.command_ring.submit(&Trb::enable_slot()).unwrap());
    h.hw.post(Trb::command_completion_event(
        base,
        CompletionCode::NoSlotsAvailable,
        0,
    ));
    h.event_ring.handle_irq();
    assert_eq!(
        result.now_or_never(),
        Some(Err(XhciError::Completion(CompletionCode::NoSlotsAvailable)))
    );
    assert!(h.hci.shutdowns().is_empty());
}

#[test]
fn command_ring_teardown_cancels_waiters() {
    let h = Harness::new();
    let result = h
        .event_ring
        .schedule_task(h.command_ring.submit(&Trb::noop_command()).unwrap());
    h.command_ring.deinit().unwrap();
    h.event_ring.run_until_idle();
    assert_eq!(result.now_or_never(), Some(Err(XhciError::Canceled)));
}

#[test]
fn enumeration_enables_then_addresses_the_slot() {
    let mut h = Harness::new();
    let base = command_base(&h);
    let devices = Arc::new(FakeDeviceContexts::default());
    let hub = HubInfo {
        hub_slot: 2,
        hub_port: 3,
        speed: 3,
    };
    let result = h.event_ring.schedule_task(enumerate_device(
        h.command_ring.clone(),
        devices.clone(),
        1,
        Some(hub),
    ));

    // Nothing is submitted until the scheduler runs the task.
    assert!(h.mmio.doorbells().is_empty());
    h.event_ring.run_until_idle();
    assert_eq!(h.dma.mem.read_trb(base).trb_type(), TrbType::EnableSlotCommand);

    h.hw.post(Trb::command_completion_event(base, CompletionCode::Success, 5));
    h.event_ring.handle_irq();
    assert_eq!(devices.prepared.lock().unwrap().clone(), vec![(5, 1, Some(hub))]);

    let address = h.dma.mem.read_trb(base + 16);
    assert_eq!(address.trb_type(), TrbType::AddressDeviceCommand);
    assert_eq!(address.parameter, 0x7_0000);
    assert_eq!(address.slot_id(), 5);
    assert_eq!(h.mmio.doorbells(), vec![(0, 0), (0, 0)]);

    h.hw.post(Trb::command_completion_event(base + 16, CompletionCode::Success, 5));
    h.event_ring.handle_irq();
    let addressed = result.now_or_never().unwrap().unwrap();
    assert_eq!(addressed.slot_id(), 5);
}

#[test]
fn failed_address_device_releases_the_slot() {
    let mut h = Harness::new();
    let base = command_base(&h);
    let devices = Arc::new(FakeDeviceContexts {
        fail: true,
        ..FakeDeviceContexts::default()
    });
    let result = h.event_ring.schedule_task(enumerate_device(
        h.command_ring.clone(),
        devices,
        2,
        None,
    ));
    h.event_ring.run_until_idle();

    h.hw.post(Trb::command_completion_event(base, CompletionCode::Success, 4));
    h.event_ring.handle_irq();

    assert_eq!(result.now_or_never(), Some(Err(XhciError::OutOfMemory)));
    let disable = h.dma.mem.read_trb(base + 16);
    assert_eq!(disable.trb_type(), TrbType::DisableSlotCommand);
    assert_eq!(disable.slot_id(), 4);
}

#[test]
fn interrupter_thread_drains_rearms_and_exits() {
    let mut h = Harness::new();
    let irq = Arc::new(FakeInterrupt::default());
    let interrupter = Interrupter::new(0, h.event_ring.clone(), irq.clone());
    interrupter.start().unwrap();
    assert_eq!(interrupter.start(), Err(XhciError::AlreadyInitialized));

    h.hw.post(Trb::port_status_change_event(2));
    irq.trigger();
    irq.wait_for_acks(1);
    assert_eq!(h.hci.port_changes(), vec![2]);
    assert_eq!(
        Iman::from_bits_retain(h.mmio.value(IMAN)),
        Iman::IP | Iman::IE
    );

    interrupter.stop();
    assert!(!interrupter.is_running());
    assert_eq!(h.hci.exited(), vec![0]);
}
