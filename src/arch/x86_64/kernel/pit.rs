//! Legacy 8254 PIT, used only once at boot to calibrate the TSC frequency
//! [`super::systemtime`] needs to turn `rdtsc` deltas into nanoseconds
//! (spec §4's "C10").

use x86_64::instructions::port::Port;

const PIT_FREQUENCY_HZ: u32 = 1_193_182;
const CHANNEL2_DATA: u16 = 0x42;
const MODE_COMMAND: u16 = 0x43;
const PC_SPEAKER_GATE: u16 = 0x61;

/// Gates PIT channel 2 open, counts down from a value corresponding to
/// ~10 ms, and measures the TSC delta across that window. Returns the
/// derived TSC frequency for one round; [`calibrate`] runs this three
/// times and keeps the median to damp the occasional SMI/NMI-lengthened
/// round (spec §4.8's "three rounds, median").
fn calibrate_once() -> u64 {
	const CALIBRATION_MS: u32 = 10;
	let count = (PIT_FREQUENCY_HZ / 1000 * CALIBRATION_MS) as u16;

	let mut mode_cmd: Port<u8> = Port::new(MODE_COMMAND);
	let mut channel2: Port<u8> = Port::new(CHANNEL2_DATA);
	let mut speaker_gate: Port<u8> = Port::new(PC_SPEAKER_GATE);

	unsafe {
		let gate = speaker_gate.read();
		speaker_gate.write((gate & 0xFC) | 0x01);

		mode_cmd.write(0b1011_0000); // channel 2, lobyte/hibyte, mode 0, binary
		channel2.write((count & 0xFF) as u8);
		channel2.write((count >> 8) as u8);

		let start = super::processor::rdtsc();
		loop {
			let gate = speaker_gate.read();
			if gate & 0x20 != 0 {
				break;
			}
			core::hint::spin_loop();
		}
		let end = super::processor::rdtsc();

		let ticks_per_ms = (end - start) / CALIBRATION_MS as u64;
		ticks_per_ms * 1000
	}
}

/// Runs [`calibrate_once`] three times and keeps the median reading, then
/// publishes it to [`super::systemtime`]. Called once, by CPU 0, before any
/// AP starts (every CPU then shares the resulting frequency — invariant
/// TSCs run in lockstep).
pub fn calibrate() {
	let mut rounds = [calibrate_once(), calibrate_once(), calibrate_once()];
	rounds.sort_unstable();
	super::systemtime::set_tsc_hz(rounds[1]);
}
