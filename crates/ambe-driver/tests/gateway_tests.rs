//! End-to-end gateway tests: a virtual chip served over TCP.

mod common;

use std::net::TcpListener;
use std::sync::Arc;
use std::thread;

use ambe_driver::mock::{MockFifoDevice, Responder};
use ambe_driver::rpc::{self, RpcDevice};
use ambe_driver::{
    Api, Device, DeviceManager, DriverError, FifoScheduler, MultiQueueScheduler, Scheduler,
};
use ambe_proto::field;

use common::{control_frame, frame};

fn chip_responder() -> Responder {
    Box::new(|packet: &[u8]| {
        if packet.is_empty() {
            return Some(control_frame(&[field::READY], true));
        }
        let payload = &packet[4..];
        match packet[3] {
            0x00 => match payload.first() {
                Some(&tag) if field::channel_of(tag).is_some() => {
                    Some(control_frame(&[tag, 0, payload[1], 0], false))
                }
                Some(&tag) => Some(control_frame(&[tag, 0], false)),
                None => None,
            },
            0x02 => {
                let mut body = vec![payload[0], field::CHAND, 48];
                body.extend_from_slice(&[0x5a; 6]);
                Some(frame(0x01, &body, false))
            }
            _ => None,
        }
    })
}

/// Start a gateway around a virtual three-channel chip; returns its
/// address.
fn start_gateway() -> (String, Arc<MockFifoDevice>, Arc<MultiQueueScheduler>) {
    let chip = Arc::new(MockFifoDevice::new(3));
    chip.set_uses_parity(false);
    chip.set_responder(Some(chip_responder()));

    let scheduler = Arc::new(MultiQueueScheduler::new(chip.clone(), 3).unwrap());
    scheduler.start().unwrap();

    let manager = Arc::new(DeviceManager::new());
    manager
        .add("mock", chip.clone(), scheduler.clone())
        .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    thread::spawn(move || rpc::serve(listener, manager));

    (addr, chip, scheduler)
}

#[test]
fn client_round_trips_through_the_gateway() {
    let (addr, _chip, chip_scheduler) = start_gateway();

    let device = Arc::new(RpcDevice::new(addr));
    let scheduler = Arc::new(FifoScheduler::new(device.clone()));
    device.start().unwrap();
    scheduler.start().unwrap();

    // Handshake: first client gets channel 0 and the chip's parity mode.
    assert_eq!(device.assigned_channel(), 0);
    assert!(!device.uses_parity());

    let api = Api::new(device.clone(), scheduler.clone(), true);
    api.compand(false, false).unwrap();
    api.ratet(device.assigned_channel(), 33).unwrap();
    api.init(device.assigned_channel(), true, true).unwrap();

    let samples = [0i16; 160];
    let response = api
        .compress(device.assigned_channel(), &samples)
        .unwrap()
        .wait()
        .unwrap();
    let (bits, count) = response.bits().unwrap();
    assert_eq!(count, 48);
    assert_eq!(bits, [0x5a; 6]);

    scheduler.stop().unwrap();
    device.stop().unwrap();
    chip_scheduler.stop().unwrap();
}

#[test]
fn gateway_echoes_pings() {
    let (addr, _chip, chip_scheduler) = start_gateway();

    let stream = std::net::TcpStream::connect(&addr).unwrap();
    let mut reader = &stream;
    let (kind, _, _) = rpc::wire::read_frame(&mut reader).unwrap().unwrap();
    assert_eq!(kind, rpc::wire::HELLO);

    let mut writer = &stream;
    rpc::wire::write_frame(&mut writer, rpc::wire::PING, 42, b"marco").unwrap();
    let (kind, tag, payload) = rpc::wire::read_frame(&mut reader).unwrap().unwrap();
    assert_eq!(kind, rpc::wire::PING);
    assert_eq!(tag, 42);
    assert_eq!(payload, b"marco");

    drop(stream);
    chip_scheduler.stop().unwrap();
}

#[test]
fn gateway_assigns_channels_and_refuses_when_exhausted() {
    let (addr, _chip, chip_scheduler) = start_gateway();

    let clients: Vec<Arc<RpcDevice>> = (0..3)
        .map(|i| {
            let device = Arc::new(RpcDevice::new(addr.clone()));
            device.start().unwrap();
            assert_eq!(device.assigned_channel(), i);
            device
        })
        .collect();

    // All three channels are bound; the fourth client is refused.
    let late = RpcDevice::new(addr.clone());
    assert!(matches!(late.start(), Err(DriverError::NoChannelsLeft)));

    // Stopping a client releases its channel for the next one.
    clients[1].stop().unwrap();
    let replacement = RpcDevice::new(addr);
    replacement.start().unwrap();
    assert_eq!(replacement.assigned_channel(), 1);
    replacement.stop().unwrap();

    for client in [&clients[0], &clients[2]] {
        client.stop().unwrap();
    }
    chip_scheduler.stop().unwrap();
}
