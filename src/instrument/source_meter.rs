//! Keithley source-measure unit driver (2450 SCPI and 2636B TSP).

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

use crate::dialect::SmuDialect;
use crate::error::{DaqError, DaqResult};
use crate::measurement::{MeasureType, SourceSpec};
use crate::session::CommandChannel;
use crate::validator::ResponseValidator;

/// Source-measure unit driver.
///
/// Output can only be enabled after [`SourceMeter::configure`] has written the compliance
/// limit.
pub struct SourceMeter<C> {
    channel: C,
    dialect: SmuDialect,
    validator: ResponseValidator,
    source: Option<SourceSpec>,
    output_on: bool,
    reset_settle: Duration,
}

impl<C: CommandChannel> SourceMeter<C> {
    /// Creates a driver speaking `dialect` over `channel`.
    pub fn new(channel: C, dialect: SmuDialect, validator: ResponseValidator) -> Self {
        Self {
            channel,
            dialect,
            validator,
            source: None,
            output_on: false,
            reset_settle: Duration::from_secs(1),
        }
    }

    /// Wait applied after `*RST` before further commands.
    pub fn with_reset_settle(mut self, settle: Duration) -> Self {
        self.reset_settle = settle;
        self
    }

    /// Active dialect.
    pub fn dialect(&self) -> &SmuDialect {
        &self.dialect
    }

    /// Source configuration written by the last [`SourceMeter::configure`].
    pub fn source(&self) -> Option<&SourceSpec> {
        self.source.as_ref()
    }

    /// Whether this driver last switched the output on.
    pub fn output_enabled(&self) -> bool {
        self.output_on
    }

    /// Release the underlying channel.
    pub fn into_inner(self) -> C {
        self.channel
    }

    /// Reset the instrument and wait for it to settle.
    pub async fn reset(&mut self) -> DaqResult<()> {
        self.channel.write_command(&self.dialect.reset()).await?;
        if !self.reset_settle.is_zero() {
            sleep(self.reset_settle).await;
        }
        self.source = None;
        self.output_on = false;
        Ok(())
    }

    /// Reset, then write source function, compliance, level, measure function, NPLC and
    /// sense mode. Output stays off.
    pub async fn configure(&mut self, spec: &SourceSpec) -> DaqResult<()> {
        spec.validate()?;
        self.reset().await?;
        for command in self.dialect.configure(spec) {
            self.channel.write_command(&command).await?;
        }
        info!(
            source = ?spec.source_type,
            level = spec.value,
            compliance = spec.compliance_limit,
            sense = ?spec.sense,
            "source-measure unit configured"
        );
        self.source = Some(spec.clone());
        Ok(())
    }

    fn configured(&self) -> DaqResult<&SourceSpec> {
        self.source.as_ref().ok_or_else(|| {
            DaqError::Configuration(
                "source-measure unit must be configured (compliance written) before sourcing"
                    .to_string(),
            )
        })
    }

    /// Write a new source level in the configured source function.
    pub async fn set_level(&mut self, value: f64) -> DaqResult<()> {
        let source_type = self.configured()?.source_type;
        let command = self.dialect.source_level(source_type, value);
        self.channel.write_command(&command).await
    }

    /// Switch the output on.
    pub async fn enable_output(&mut self) -> DaqResult<()> {
        self.configured()?;
        self.channel.write_command(&self.dialect.output(true)).await?;
        self.output_on = true;
        Ok(())
    }

    /// Switch the output off. Allowed in any state.
    pub async fn disable_output(&mut self) -> DaqResult<()> {
        self.channel
            .write_command(&self.dialect.output(false))
            .await?;
        if self.output_on {
            debug!("source-measure unit output off");
        }
        self.output_on = false;
        Ok(())
    }

    /// Measure one value with stale-banner recovery.
    pub async fn measure(&mut self, measure: MeasureType) -> DaqResult<f64> {
        let query = self.dialect.measure_query(measure);
        self.validator.query_numeric(&mut self.channel, &query).await
    }

    /// Program the pulse width, fire one pulse and wait for it to finish.
    pub async fn fire_pulse(&mut self, width: Duration, delay: Duration) -> DaqResult<()> {
        self.configured()?;
        let width_command = self.dialect.pulse_width(width)?;
        let trigger = self.dialect.pulse_trigger()?;
        self.channel.write_command(&width_command).await?;
        self.channel.write_command(&trigger).await?;
        sleep(width + delay).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MockAdapter;
    use crate::dialect::InstrumentKind;
    use crate::measurement::SenseMode;
    use crate::session::{InstrumentHandle, InstrumentSession};
    use crate::validator::RecoveryPolicy;

    fn driver(adapter: &MockAdapter, kind: InstrumentKind) -> SourceMeter<InstrumentSession> {
        let session = InstrumentSession::new(
            InstrumentHandle::new("mock", kind),
            Box::new(adapter.clone()),
            Duration::from_secs(1),
        );
        SourceMeter::new(
            session,
            SmuDialect::for_kind(kind, None).unwrap(),
            ResponseValidator::new(RecoveryPolicy::default()).unwrap(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_refused_before_configure() {
        let adapter = MockAdapter::new();
        let mut smu = driver(&adapter, InstrumentKind::Keithley2450);
        assert!(matches!(
            smu.enable_output().await,
            Err(DaqError::Configuration(_))
        ));
        assert!(smu.set_level(1.0).await.is_err());
        assert!(adapter.call_log().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scpi_compliance_precedes_output() {
        let adapter = MockAdapter::new();
        let mut smu = driver(&adapter, InstrumentKind::Keithley2450);
        smu.configure(&SourceSpec::voltage(0.0, 1e-3)).await.unwrap();
        smu.enable_output().await.unwrap();

        let log = adapter.call_log();
        let compliance = log.iter().position(|c| c == "SENS:CURR:PROT 0.001").unwrap();
        let output = log.iter().position(|c| c == ":OUTP ON").unwrap();
        assert_eq!(log[0], "*RST");
        assert!(compliance < output);
        assert!(smu.output_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tsp_configure_and_measure() {
        let adapter = MockAdapter::new().on("print(smua.measure.i())", "2.5e-6");
        let mut smu = driver(&adapter, InstrumentKind::Keithley2636B);
        let spec = SourceSpec::voltage(0.1, 1e-4)
            .with_sense(SenseMode::Remote)
            .with_delay(Duration::from_millis(50));
        smu.configure(&spec).await.unwrap();
        smu.set_level(0.2).await.unwrap();
        smu.enable_output().await.unwrap();
        assert_eq!(smu.measure(MeasureType::Current).await.unwrap(), 2.5e-6);

        let log = adapter.call_log();
        assert!(log.contains(&"smua.sense = smua.SENSE_REMOTE".to_string()));
        assert!(log.contains(&"smua.source.delay = 0.05".to_string()));
        assert!(log.contains(&"smua.source.levelv = 0.2".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_requires_tsp() {
        let adapter = MockAdapter::new();
        let mut smu = driver(&adapter, InstrumentKind::Keithley2450);
        smu.configure(&SourceSpec::voltage(0.0, 1e-3)).await.unwrap();
        let err = smu
            .fire_pulse(Duration::from_millis(1), Duration::from_millis(1))
            .await
            .unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pulse_waits_width_plus_delay() {
        let adapter = MockAdapter::new();
        let mut smu = driver(&adapter, InstrumentKind::Keithley2636B);
        smu.configure(&SourceSpec::voltage(0.0, 1e-3)).await.unwrap();
        let start = tokio::time::Instant::now();
        smu.fire_pulse(Duration::from_millis(10), Duration::from_millis(40))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(50));
        assert_eq!(
            adapter.call_log().last().map(String::as_str),
            Some("smua.source.initiate()")
        );
    }
}
