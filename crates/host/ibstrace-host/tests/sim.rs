//! Full upload, trigger, and drain cycles against the simulated unit.

use std::sync::Arc;

use ibstrace_core::error::{EFAULT, EINVAL};
use ibstrace_core::protocol::{Command, NoPayload, PreciseArgs};
use ibstrace_core::sample::{SAMPLE_SIZE, Sample};
use ibstrace_core::{Config, Coordinator, TriggerMode};
use ibstrace_host::sim::RET;
use ibstrace_host::{SimConfig, SimulatedUnit, simulated_platform};

/// `mov eax, 42`, ten `nop`s, `ret`.
const PAYLOAD: [u8; 16] = [
    0xb8, 0x2a, 0x00, 0x00, 0x00, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, RET,
];

fn start(config: Config, iterations: u64) -> (Coordinator, Arc<SimulatedUnit>) {
    let sim = SimConfig { iterations, pin: false };
    let (platform, unit) = simulated_platform(&config, &sim).unwrap();
    (Coordinator::new(config, platform).unwrap(), unit)
}

fn config() -> Config {
    Config {
        sample_capacity: 1 << 12,
        code_pages: 1,
        sample_period: 0x100,
        ..Config::default()
    }
}

#[test]
fn measure_then_drain_returns_every_record() {
    let (coord, unit) = start(config(), 0x400);
    coord.upload(&PAYLOAD).unwrap();

    let outcome = coord.trigger(TriggerMode::Measure).unwrap();
    assert_eq!(outcome.return_value, 16 * 0x400);
    assert!(outcome.sample_count > 0);
    assert_eq!(u64::try_from(outcome.sample_count).unwrap(), unit.overflows());
    assert_eq!(unit.unhandled(), 0);

    let k = coord.sample_count().unwrap();
    assert_eq!(k, outcome.sample_count);

    let code_addr = coord.diagnostics().code_addr as u64;
    let bytes = coord.drain(usize::MAX).unwrap();
    assert_eq!(bytes.len(), k * SAMPLE_SIZE);
    for sample in Sample::parse_all(&bytes) {
        assert!((code_addr..code_addr + 16).contains(&sample.rip));
        assert_eq!(sample.data, u64::from(PAYLOAD[(sample.rip - code_addr) as usize]));
        assert_eq!(sample.tgt_rip, 0);
    }

    assert_eq!(coord.sample_count().unwrap(), 0);
    assert!(coord.drain(usize::MAX).unwrap().is_empty());
}

#[test]
fn precise_latches_branch_target_and_scratch() {
    let (coord, _unit) = start(config(), 0x100);
    coord.upload(&PAYLOAD).unwrap();

    let outcome = coord.trigger(TriggerMode::Precise { arg: 0xdead, offset: 5 }).unwrap();
    assert_eq!(coord.scratch_word(0).unwrap(), Some(outcome.return_value));

    let code_addr = coord.diagnostics().code_addr as u64;
    let samples = coord.drain_samples().unwrap();
    assert!(!samples.is_empty());
    assert!(samples.iter().all(|s| s.tgt_rip == code_addr + 5));
}

#[test]
fn samples_accumulate_across_triggers_until_drained() {
    let (coord, _unit) = start(config(), 0x100);
    coord.upload(&PAYLOAD).unwrap();

    let first = coord.trigger(TriggerMode::Measure).unwrap().sample_count;
    let second = coord.trigger(TriggerMode::Measure).unwrap().sample_count;
    assert!(second > first);
    assert_eq!(coord.drain_samples().unwrap().len(), second);
}

#[test]
fn full_buffer_drops_extra_records() {
    let config = Config { sample_capacity: 8, ..config() };
    let (coord, unit) = start(config, 0x400);
    coord.upload(&PAYLOAD).unwrap();

    let outcome = coord.trigger(TriggerMode::Measure).unwrap();
    assert_eq!(outcome.sample_count, 8);
    assert!(unit.overflows() > 8);
    let diag = coord.diagnostics();
    assert_eq!(diag.collector.dropped, unit.overflows() - 8);
    assert_eq!(coord.drain(usize::MAX).unwrap().len(), 8 * SAMPLE_SIZE);
}

#[test]
fn sampling_off_runs_unmeasured() {
    let config = Config { sampling: false, ..config() };
    let (coord, unit) = start(config, 0x100);
    coord.upload(&PAYLOAD).unwrap();

    let outcome = coord.trigger(TriggerMode::Measure).unwrap();
    assert_eq!(outcome.return_value, 16 * 0x100);
    assert_eq!(outcome.sample_count, 0);
    assert_eq!(unit.overflows(), 0);
}

#[test]
fn request_interface_drives_the_cycle() {
    let (coord, _unit) = start(config(), 0x100);

    assert_eq!(coord.ioctl(Command::Capacity.code(), &NoPayload), 1 << 12);
    assert_eq!(coord.ioctl(Command::Measure.code(), &NoPayload), -EINVAL);
    assert_eq!(coord.ioctl(Command::Write.code(), &PAYLOAD), 0);
    assert_eq!(coord.ioctl(Command::Measure.code(), &NoPayload), 0);

    let precise = PreciseArgs { arg: 1, offset: 3 }.to_bytes();
    assert_eq!(coord.ioctl(Command::Precise.code(), &precise), 0);

    let k = coord.ioctl(Command::Samples.code(), &NoPayload);
    assert!(k > 0);

    // A short destination takes whole records only.
    let mut small = [0u8; SAMPLE_SIZE + 10];
    let len = small.len();
    assert_eq!(coord.read(&mut &mut small[..], len), SAMPLE_SIZE as i64);
    assert_eq!(coord.ioctl(Command::Samples.code(), &NoPayload), 0);
    assert_eq!(coord.read(&mut Vec::<u8>::new(), 4096), 0);
}

#[test]
fn faulting_read_keeps_records() {
    let (coord, _unit) = start(config(), 0x100);
    coord.upload(&PAYLOAD).unwrap();
    let k = coord.trigger(TriggerMode::Measure).unwrap().sample_count;

    // Claims room for every record but only has space for one.
    let mut short = [0u8; SAMPLE_SIZE];
    let status = coord.read(&mut &mut short[..], k * SAMPLE_SIZE);
    if k > 1 {
        assert_eq!(status, -EFAULT);
        assert_eq!(coord.sample_count().unwrap(), k);
    } else {
        assert_eq!(status, SAMPLE_SIZE as i64);
    }
}

#[test]
fn unit_is_detached_on_shutdown() {
    let (coord, unit) = start(config(), 1);
    drop(coord);
    // No handler is left behind to claim the line.
    assert_eq!(unit.raise(), ibstrace_core::platform::NmiStatus::NotHandled);
}
