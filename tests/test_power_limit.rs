mod common;
use common::*;

use hoymiles_bridge::coordinator::{Coordinator, ModbusRequest};
use hoymiles_bridge::hoymiles::command::SETTLE_MS;
use hoymiles_bridge::hoymiles::frame;
use hoymiles_bridge::poller::BusCommand;
use hoymiles_bridge::prelude::*;
use hoymiles_bridge::sunspec::image::{BASE_ADDR, OFF_M123};
use hoymiles_bridge::sunspec::model;

struct Rig {
    coordinator: Coordinator,
    bus: broadcast::Receiver<BusCommand>,
}

fn rig(config: std::sync::Arc<Config>) -> Rig {
    let channels = Channels::new();
    let bus = channels.to_bus.subscribe();
    Rig {
        coordinator: Coordinator::new(config, channels),
        bus,
    }
}

impl Rig {
    fn write_single(&mut self, reg: u16, value: u16) -> Option<Vec<u8>> {
        let mut pdu = vec![0x06];
        pdu.extend_from_slice(&reg.to_be_bytes());
        pdu.extend_from_slice(&value.to_be_bytes());
        let (req, _reply) = ModbusRequest::new(0, 126, pdu);
        self.coordinator.handle_request(&req)
    }

    fn write_controls(&mut self, pct: u16, ena: u16) -> Option<Vec<u8>> {
        // one write-multiple spanning WMaxLimPct .. WMaxLim_Ena
        let start = BASE_ADDR + (OFF_M123 + 2 + model::CTL_WMAX_LIM_PCT) as u16;
        let values = [pct, 0xFFFF, 0xFFFF, ena];
        let mut pdu = vec![0x10];
        pdu.extend_from_slice(&start.to_be_bytes());
        pdu.extend_from_slice(&4u16.to_be_bytes());
        pdu.push(8);
        for v in values {
            pdu.extend_from_slice(&v.to_be_bytes());
        }
        let (req, _reply) = ModbusRequest::new(0, 126, pdu);
        self.coordinator.handle_request(&req)
    }

    fn emitted_frames(&mut self) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        while let Ok(cmd) = self.bus.try_recv() {
            if let BusCommand::Write(writes) = cmd {
                for w in writes {
                    assert_eq!(w.settle_ms, SETTLE_MS);
                    frames.push(w.frame);
                }
            }
        }
        frames
    }
}

const PCT_ADDR: u16 = BASE_ADDR + (OFF_M123 + 2 + model::CTL_WMAX_LIM_PCT) as u16;
const ENA_ADDR: u16 = BASE_ADDR + (OFF_M123 + 2 + model::CTL_WMAX_LIM_ENA) as u16;

// a 50% limit on two sources: limit then ON, port 0 then port 1, all
// framed for the DTU address
#[test]
fn enable_emits_limit_and_coil_per_source() {
    let mut rig = rig(Factory::two_source_config());

    assert!(rig.write_controls(500, 1).is_some());

    assert_eq!(
        rig.emitted_frames(),
        vec![
            frame::build_write_single(126, 0xC007, 50),
            frame::build_write_coil(126, 0xC006, true),
            frame::build_write_single(126, 0xC00D, 50),
            frame::build_write_coil(126, 0xC00C, true),
        ]
    );
}

#[test]
fn limit_values_are_clamped() {
    let mut rig = rig(Factory::config());

    let _ = rig.write_controls(330, 1);
    assert_eq!(
        rig.emitted_frames(),
        vec![
            frame::build_write_single(126, 0xC007, 33),
            frame::build_write_coil(126, 0xC006, true),
        ]
    );

    let _ = rig.write_controls(5, 1);
    assert_eq!(
        rig.emitted_frames()[0],
        frame::build_write_single(126, 0xC007, 2)
    );

    let _ = rig.write_controls(2000, 1);
    assert_eq!(
        rig.emitted_frames()[0],
        frame::build_write_single(126, 0xC007, 100)
    );
}

// disabling restores 100% per source and writes no coil
#[test]
fn disable_restores_full_output() {
    let mut rig = rig(Factory::two_source_config());

    let _ = rig.write_controls(500, 1);
    rig.emitted_frames();

    let _ = rig.write_single(ENA_ADDR, 0);
    assert_eq!(
        rig.emitted_frames(),
        vec![
            frame::build_write_single(126, 0xC007, 100),
            frame::build_write_single(126, 0xC00D, 100),
        ]
    );
}

// single-register writes fire per touched control word
#[test]
fn sequential_single_writes() {
    let mut rig = rig(Factory::config());

    // setting the percentage while still disabled forwards the disabled
    // state (limit back to 100, no coil)
    let _ = rig.write_single(PCT_ADDR, 500);
    assert_eq!(
        rig.emitted_frames(),
        vec![frame::build_write_single(126, 0xC007, 100)]
    );

    // enabling then forwards the stored percentage
    let _ = rig.write_single(ENA_ADDR, 1);
    assert_eq!(
        rig.emitted_frames(),
        vec![
            frame::build_write_single(126, 0xC007, 50),
            frame::build_write_coil(126, 0xC006, true),
        ]
    );
}

// writes to non-control words inside Model 123 do not reach the bus
#[test]
fn non_control_writes_do_not_forward() {
    let mut rig = rig(Factory::config());

    let conn_addr = BASE_ADDR + (OFF_M123 + 2 + model::CTL_CONN) as u16;
    assert!(rig.write_single(conn_addr, 1).is_some());
    assert!(rig.emitted_frames().is_empty());
}
