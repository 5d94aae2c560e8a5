//! Stateful instrument simulations for running without hardware.
//!
//! Each simulation is a [`MockAdapter`] responder that tracks the settings written to it
//! and answers queries from a simple physical model:
//! - Source-measure units drive a 1 kΩ resistor.
//! - Temperature controllers sit exactly at their setpoint.
//! - The lock-in measures the current its sine output drives through 1 kΩ.

use super::{MockAdapter, MockReply};
use crate::dialect::InstrumentKind;

/// Load resistance seen by simulated sources, in ohms.
pub const SIMULATED_LOAD_OHMS: f64 = 1_000.0;

/// A connected mock adapter simulating an instrument of `kind`.
pub fn simulated_instrument(kind: InstrumentKind) -> MockAdapter {
    let adapter = MockAdapter::new().with_name(format!("simulated {kind}"));
    match kind {
        InstrumentKind::Keithley2450 | InstrumentKind::Keithley2636B => {
            let mut sim = SourceMeterSim::new(kind);
            adapter.with_responder(move |cmd| sim.respond(cmd))
        }
        InstrumentKind::LakeShore335 | InstrumentKind::LakeShore325 => {
            let mut sim = TemperatureSim::new(kind);
            adapter.with_responder(move |cmd| sim.respond(cmd))
        }
        InstrumentKind::Sr830 => {
            let mut sim = LockInSim::default();
            adapter.with_responder(move |cmd| sim.respond(cmd))
        }
    }
}

fn identity(kind: InstrumentKind) -> &'static str {
    match kind {
        InstrumentKind::Keithley2450 => "KEITHLEY INSTRUMENTS,MODEL 2450,04096218,1.7.12b",
        InstrumentKind::Keithley2636B => "Keithley Instruments Inc., Model 2636B, 4439011, 3.2.2",
        InstrumentKind::LakeShore335 => "LSCI,MODEL335,LSA1234,1.10",
        InstrumentKind::LakeShore325 => "LSCI,MODEL325,LSB5678,1.6",
        InstrumentKind::Sr830 => "Stanford_Research_Systems,SR830,s/n48379,ver1.07",
    }
}

fn text(value: f64) -> Option<MockReply> {
    Some(MockReply::Text(format!("{value:e}")))
}

/// Number after the last space or `=`.
fn trailing_number(cmd: &str) -> Option<f64> {
    cmd.rsplit([' ', '=', ','])
        .next()
        .and_then(|s| s.trim().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Driving {
    Volts,
    Amps,
}

struct SourceMeterSim {
    kind: InstrumentKind,
    driving: Driving,
    level: f64,
}

impl SourceMeterSim {
    fn new(kind: InstrumentKind) -> Self {
        Self {
            kind,
            driving: Driving::Volts,
            level: 0.0,
        }
    }

    fn volts(&self) -> f64 {
        match self.driving {
            Driving::Volts => self.level,
            Driving::Amps => self.level * SIMULATED_LOAD_OHMS,
        }
    }

    fn amps(&self) -> f64 {
        match self.driving {
            Driving::Volts => self.level / SIMULATED_LOAD_OHMS,
            Driving::Amps => self.level,
        }
    }

    fn respond(&mut self, cmd: &str) -> Option<MockReply> {
        let cmd = cmd.trim();
        if cmd == "*IDN?" {
            return Some(identity(self.kind).into());
        }
        if cmd.starts_with("SOUR:VOLT ") || cmd.contains(".source.levelv") {
            self.driving = Driving::Volts;
            self.level = trailing_number(cmd)?;
            return None;
        }
        if cmd.starts_with("SOUR:CURR ") || cmd.contains(".source.leveli") {
            self.driving = Driving::Amps;
            self.level = trailing_number(cmd)?;
            return None;
        }
        if cmd == "MEAS:CURR?" || cmd.ends_with(".measure.i())") {
            return text(self.amps());
        }
        if cmd == "MEAS:VOLT?" || cmd.ends_with(".measure.v())") {
            return text(self.volts());
        }
        if cmd == "MEAS:RES?" || cmd.ends_with(".measure.r())") {
            return text(SIMULATED_LOAD_OHMS);
        }
        None
    }
}

struct TemperatureSim {
    kind: InstrumentKind,
    /// Setpoint in instrument units, per loop.
    setpoints: [f64; 2],
    ranges: [u8; 2],
}

impl TemperatureSim {
    fn new(kind: InstrumentKind) -> Self {
        let ambient = match kind {
            InstrumentKind::LakeShore335 => 295.15,
            _ => 22.0,
        };
        Self {
            kind,
            setpoints: [ambient; 2],
            ranges: [0; 2],
        }
    }

    fn loop_index(arg: &str) -> Option<usize> {
        match arg.trim() {
            "1" => Some(0),
            "2" => Some(1),
            _ => None,
        }
    }

    fn respond(&mut self, cmd: &str) -> Option<MockReply> {
        let cmd = cmd.trim();
        if cmd == "*IDN?" {
            return Some(identity(self.kind).into());
        }
        if let Some(args) = cmd.strip_prefix("SETP? ") {
            return text(self.setpoints[Self::loop_index(args)?]);
        }
        if let Some(args) = cmd.strip_prefix("SETP ") {
            let (control_loop, value) = args.split_once(',')?;
            self.setpoints[Self::loop_index(control_loop)?] = value.trim().parse().ok()?;
            return None;
        }
        if let Some(args) = cmd.strip_prefix("RANGE? ") {
            let range = self.ranges[Self::loop_index(args)?];
            return Some(MockReply::Text(range.to_string()));
        }
        if let Some(args) = cmd.strip_prefix("RANGE ") {
            let (control_loop, value) = args.split_once(',')?;
            self.ranges[Self::loop_index(control_loop)?] = value.trim().parse().ok()?;
            return None;
        }
        if let Some(input) = cmd.strip_prefix("KRDG? ") {
            // input A follows loop 1, input B follows loop 2
            let index = if input.trim() == "B" { 1 } else { 0 };
            return text(self.setpoints[index]);
        }
        None
    }
}

struct LockInSim {
    frequency: f64,
    amplitude: f64,
    aux: [f64; 4],
}

impl Default for LockInSim {
    fn default() -> Self {
        Self {
            frequency: 1_000.0,
            amplitude: 0.1,
            aux: [0.0; 4],
        }
    }
}

impl LockInSim {
    /// In-phase current; a DC bias on AUX 1 scales it slightly.
    fn x(&self) -> f64 {
        self.amplitude / SIMULATED_LOAD_OHMS * (1.0 + 0.01 * self.aux[0])
    }

    fn respond(&mut self, cmd: &str) -> Option<MockReply> {
        let cmd = cmd.trim();
        match cmd {
            "*IDN?" => return Some(identity(InstrumentKind::Sr830).into()),
            "FREQ?" => return text(self.frequency),
            "SLVL?" => return text(self.amplitude),
            "OUTP? 1,2" => return Some(MockReply::Text(format!("{:e},{:e}", self.x(), 0.0))),
            "OUTP? 1" | "OUTP? 3" => return text(self.x()),
            "OUTP? 2" | "OUTP? 4" => return text(0.0),
            _ => {}
        }
        if let Some(value) = cmd.strip_prefix("FREQ ") {
            self.frequency = value.trim().parse().ok()?;
        } else if let Some(value) = cmd.strip_prefix("SLVL ") {
            self.amplitude = value.trim().parse().ok()?;
        } else if let Some(args) = cmd.strip_prefix("AUXV ") {
            let (channel, value) = args.split_once(',')?;
            let channel: usize = channel.trim().parse().ok()?;
            *self.aux.get_mut(channel.checked_sub(1)?)? = value.trim().parse().ok()?;
        }
        None
    }
}
