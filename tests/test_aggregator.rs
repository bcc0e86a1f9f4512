mod common;
use common::*;

use hoymiles_bridge::aggregator::aggregate;
use hoymiles_bridge::hoymiles::port_data::PortData;
use hoymiles_bridge::prelude::*;
use hoymiles_bridge::sunspec::image::RegisterImage;
use hoymiles_bridge::sunspec::model;
use std::time::Instant;

fn image_for(config: &Config) -> RegisterImage {
    let mut image = RegisterImage::new();
    image.build_static(&config.identity());
    image
}

fn sources_for(config: &Config) -> Vec<Source> {
    config.sources().iter().map(Source::from_config).collect()
}

fn feed(source: &mut Source, regs: &[u16]) {
    let data = PortData::parse(regs).expect("factory block must parse");
    source.apply_block(data, Instant::now());
}

#[test]
fn no_valid_sources_reports_sleeping() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let sources = sources_for(&config);

    let reading = aggregate(&sources, config.phases(), &mut image);

    assert_eq!(reading.valid_sources, 0);
    assert_eq!(reading.power_w, 0.0);
    assert!(!reading.producing);
    assert_eq!(image.inverter_payload()[model::INV_ST], 2);
    // untouched value fields stay not-implemented
    assert_eq!(image.inverter_payload()[model::INV_W], 0xFFFF);
}

// one producing single-phase source: every encoded field checks out
#[test]
fn single_source_producing() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(&mut sources[0], &Factory::producing_block());
    let reading = aggregate(&sources, config.phases(), &mut image);

    let inv = image.inverter_payload();
    assert_eq!(inv[model::INV_W] as i16, 650);
    assert_eq!(inv[model::INV_A], 282); // 650/230 A at SF -2
    assert_eq!(inv[model::INV_APH_A], 282);
    assert_eq!(inv[model::INV_APH_B], 0);
    assert_eq!(inv[model::INV_APH_C], 0);
    assert_eq!(inv[model::INV_PHV_A], 2300);
    assert_eq!(inv[model::INV_HZ], 4999);
    assert_eq!(inv[model::INV_WH], 0x0000);
    assert_eq!(inv[model::INV_WH + 1], 0x3034); // 12340 Wh
    assert_eq!(inv[model::INV_TMP_CAB] as i16, 420);
    assert_eq!(inv[model::INV_ST], 4); // MPPT

    assert!(reading.producing);
    assert_eq!(reading.valid_sources, 1);
    assert_eq!(reading.power_w, 650.0);
    assert!((reading.frequency_hz - 49.99).abs() < 0.001);
    assert!((reading.energy_kwh - 12.34).abs() < 0.001);
}

// DC side is summed from the PV values
#[test]
fn dc_power_is_summed() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(&mut sources[0], &Factory::producing_block());
    aggregate(&sources, config.phases(), &mut image);

    let inv = image.inverter_payload();
    assert_eq!(inv[model::INV_DCW] as i16, 650);
}

// two sources on different phases: power credits stay separate
#[test]
fn phase_distribution_across_two_sources() {
    let config = Factory::two_source_config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(
        &mut sources[0],
        &Factory::port_block(400, 230, 5000, 0, 1000, 30),
    );
    feed(
        &mut sources[1],
        &Factory::port_block(600, 230, 5000, 0, 2000, 35),
    );
    let reading = aggregate(&sources, config.phases(), &mut image);

    assert_eq!(reading.power_w, 1000.0);
    assert_eq!(reading.phase_power_w, [400.0, 600.0, 0.0]);

    let inv = image.inverter_payload();
    assert_eq!(inv[model::INV_W] as i16, 1000);
    // total current mirrors the reading through the same encoding
    assert_eq!(inv[model::INV_A], (reading.current_a * 100.0) as u16);
    assert!((reading.current_a - (400.0 + 600.0) / 230.0).abs() < 0.05);
    // phase B carries only the second source
    assert!(inv[model::INV_APH_B] > 0);
    assert_eq!(inv[model::INV_APH_C], 0);
    // energy sums over the acc32 accumulators
    assert_eq!(inv[model::INV_WH + 1], 3000);
    // hottest source wins
    assert_eq!(inv[model::INV_TMP_CAB] as i16, 350);
}

// aggregation linearity: N sources on L1 add up on L1 and only there
#[test]
fn power_linearity_on_one_phase() {
    let config = Factory::config_yaml(
        r#"
serial_port: /dev/null
unit_id: 126
phases: 1
rated_voltage: 230
sources:
  - { port_number: 0, name: a, model: HMS-800-2T, connected_phase: 1 }
  - { port_number: 1, name: b, model: HMS-800-2T, connected_phase: 1 }
  - { port_number: 2, name: c, model: HMS-800-2T, connected_phase: 1 }
"#,
    );
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    for (i, watts) in [150u16, 250, 300].iter().enumerate() {
        feed(
            &mut sources[i],
            &Factory::port_block(*watts, 230, 5000, 0, 0, 25),
        );
    }
    let reading = aggregate(&sources, config.phases(), &mut image);

    assert_eq!(reading.phase_power_w[0], 700.0);
    assert_eq!(reading.phase_power_w[1], 0.0);
    assert_eq!(reading.phase_power_w[2], 0.0);
    assert_eq!(reading.power_w, 700.0);
}

// a balanced three-phase aggregate gets line-to-line voltages
#[test]
fn line_to_line_voltages() {
    let config = Factory::config_yaml(
        r#"
serial_port: /dev/null
unit_id: 126
phases: 3
rated_voltage: 230
sources:
  - { port_number: 0, name: t, model: HMT-1800-4T }
"#,
    );
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);
    assert_eq!(sources[0].phases, 3);

    feed(
        &mut sources[0],
        &Factory::port_block(900, 230, 5000, 0, 0, 25),
    );
    aggregate(&sources, config.phases(), &mut image);

    let inv = image.inverter_payload();
    // sqrt(3) * 230 = 398.37 V, within a digit of rounding
    for off in [model::INV_PPV_AB, model::INV_PPV_BC, model::INV_PPV_CA] {
        assert!(
            (3983..=3984).contains(&inv[off]),
            "V_LL register was {}",
            inv[off]
        );
    }
    // three-phase source: replicated voltage, current in thirds
    assert_eq!(inv[model::INV_PHV_A], 2300);
    assert_eq!(inv[model::INV_PHV_B], 2300);
    assert_eq!(inv[model::INV_PHV_C], 2300);
    assert_eq!(inv[model::INV_APH_A], inv[model::INV_APH_B]);
    assert_eq!(inv[model::INV_APH_B], inv[model::INV_APH_C]);
}

// single-phase aggregates never get line-to-line voltages
#[test]
fn no_line_to_line_for_single_phase() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(&mut sources[0], &Factory::producing_block());
    aggregate(&sources, config.phases(), &mut image);

    assert_eq!(image.inverter_payload()[model::INV_PPV_AB], 0xFFFF);
}

// PF is only written when apparent power is known, and is clamped to 1
#[test]
fn power_factor_clamp() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(&mut sources[0], &Factory::producing_block());

    // the DTU gives no VA, so no PF either
    aggregate(&sources, config.phases(), &mut image);
    assert_eq!(image.inverter_payload()[model::INV_PF], 0xFFFF);

    // pretend the source knew its apparent power
    sources[0].raw_regs[model::INV_VA] = 500;
    aggregate(&sources, config.phases(), &mut image);
    let inv = image.inverter_payload();
    assert_eq!(inv[model::INV_VA] as i16, 500);
    assert_eq!(inv[model::INV_PF] as i16, 100); // 650/500 clamps to 1.00

    sources[0].raw_regs[model::INV_VA] = 1000;
    aggregate(&sources, config.phases(), &mut image);
    assert_eq!(image.inverter_payload()[model::INV_PF] as i16, 65); // 650/1000
}

// an idle source flips the state back to sleeping
#[test]
fn idle_source_sleeps() {
    let config = Factory::config();
    let mut image = image_for(&config);
    let mut sources = sources_for(&config);

    feed(
        &mut sources[0],
        &Factory::port_block(0, 230, 5000, 0, 500, 20),
    );
    let reading = aggregate(&sources, config.phases(), &mut image);

    assert!(!reading.producing);
    assert_eq!(reading.valid_sources, 1);
    assert_eq!(image.inverter_payload()[model::INV_ST], 2);
    assert_eq!(image.inverter_payload()[model::INV_W] as i16, 0);
}
