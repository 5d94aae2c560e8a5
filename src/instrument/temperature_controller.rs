//! LakeShore 335 / 325 temperature controller driver
//!
//! All temperatures cross this API in °C. The 335 reports and accepts Kelvin, so the
//! driver converts in both directions; the 325 is already configured in Celsius.
//!
//! Sensor reads are never retried. A reply that does not parse is returned as
//! [`DaqError::Parse`] straight away, unlike source-measure unit reads.

use async_trait::async_trait;
use tracing::{debug, info};

use super::TemperatureSensor;
use crate::dialect::LakeShoreModel;
use crate::error::DaqResult;
use crate::session::CommandChannel;
use crate::validator::ResponseValidator;

/// LakeShore temperature controller driver.
pub struct TemperatureController<C> {
    channel: C,
    model: LakeShoreModel,
    validator: ResponseValidator,
}

impl<C: CommandChannel> TemperatureController<C> {
    /// Creates a driver for `model` over `channel`.
    pub fn new(channel: C, model: LakeShoreModel, validator: ResponseValidator) -> Self {
        Self {
            channel,
            model,
            validator,
        }
    }

    /// Controller model.
    pub fn model(&self) -> LakeShoreModel {
        self.model
    }

    /// Release the underlying channel.
    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Write the control-loop setpoint in °C.
    pub async fn set_setpoint(&mut self, control_loop: u8, celsius: f64) -> DaqResult<()> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.setpoint(control_loop, celsius);
        self.channel.write_command(&command).await?;
        info!(control_loop, celsius, "temperature setpoint written");
        Ok(())
    }

    /// Read back the control-loop setpoint in °C.
    pub async fn setpoint(&mut self, control_loop: u8) -> DaqResult<f64> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.setpoint_query(control_loop);
        let raw = self.channel.query(&command).await?;
        let value = self.validator.parse_numeric(&command, &raw)?;
        Ok(self.model.to_celsius(value))
    }

    /// Read sensor `input` (`A` or `B`) in °C.
    pub async fn read_input(&mut self, input: &str) -> DaqResult<f64> {
        self.model.validate_input(input)?;
        let command = self.model.temperature_query(input);
        let raw = self.channel.query(&command).await?;
        let value = self.validator.parse_numeric(&command, &raw)?;
        let celsius = self.model.to_celsius(value);
        debug!(input, celsius, "temperature read");
        Ok(celsius)
    }

    /// Select the heater range (0 switches the heater off).
    pub async fn set_heater_range(&mut self, control_loop: u8, code: u8) -> DaqResult<()> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.heater_range(control_loop, code)?;
        self.channel.write_command(&command).await
    }

    /// Read the heater range code.
    pub async fn heater_range(&mut self, control_loop: u8) -> DaqResult<u8> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.heater_range_query(control_loop);
        let raw = self.channel.query(&command).await?;
        let value = self.validator.parse_numeric(&command, &raw)?;
        Ok(value.clamp(0.0, f64::from(self.model.max_heater_range())) as u8)
    }

    /// Set PID gains.
    pub async fn set_pid(&mut self, control_loop: u8, p: f64, i: f64, d: f64) -> DaqResult<()> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.pid(control_loop, p, i, d);
        self.channel.write_command(&command).await
    }

    /// Set manual heater output in percent.
    pub async fn set_manual_output(&mut self, control_loop: u8, percent: f64) -> DaqResult<()> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.manual_output(control_loop, percent)?;
        self.channel.write_command(&command).await
    }

    /// Select closed-loop PID or open-loop control.
    pub async fn set_control_mode(&mut self, control_loop: u8, closed_loop: bool) -> DaqResult<()> {
        self.model.validate_loop(control_loop)?;
        let command = self.model.control_mode(control_loop, closed_loop);
        self.channel.write_command(&command).await
    }
}

#[async_trait]
impl<C: CommandChannel> TemperatureSensor for TemperatureController<C> {
    async fn read_temperature(&mut self, input: &str) -> DaqResult<f64> {
        self.read_input(input).await
    }
}
