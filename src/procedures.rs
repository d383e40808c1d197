//! Built-in procedures.

use crate::adapters::{Adapter, MockAdapter};
use crate::error::AppResult;
use crate::messages::{row, FieldValue};
use crate::metadata::{MetadataField, MetadataSet, MetadataWriter};
use crate::parameter::{Parameter, ParameterSet};
use crate::procedure::{Column, ExecutionContext, Procedure};
use crate::units::Quantity;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;

/// Reads a voltmeter `Loop count` times, `Delay` seconds apart.
///
/// One row per reading: the iteration index and the voltage in volts. Polls the
/// stop token before every reading and while waiting.
pub struct SweepProcedure {
    parameters: ParameterSet,
    metadata: MetadataSet,
    adapter: Box<dyn Adapter>,
}

impl SweepProcedure {
    /// Display name.
    pub const NAME: &'static str = "Voltage sweep";

    /// Sweep reading from `adapter`.
    pub fn new(adapter: Box<dyn Adapter>) -> AppResult<Self> {
        let parameters = ParameterSet::from_parameters([
            Parameter::integer("Loop count", 10)
                .with_range(0.0, 1e6)
                .with_description("Number of readings"),
            Parameter::float("Delay", 0.1)
                .with_unit("s")
                .with_range(0.0, 3600.0)
                .with_description("Wait between readings"),
            Parameter::float("Amplitude", 1.0)
                .with_unit("V")
                .with_range(-10.0, 10.0)
                .clamped(),
        ])?;
        let metadata = MetadataSet::from_fields([
            MetadataField::new("Start time"),
            MetadataField::new("Instrument").with_default("unknown"),
        ])?;
        Ok(Self {
            parameters,
            metadata,
            adapter,
        })
    }

    /// Sweep against the simulated voltmeter.
    pub fn simulated() -> AppResult<Self> {
        Self::new(Box::new(MockAdapter::voltmeter()))
    }

    /// Bind one parameter from text.
    pub fn bind(&mut self, name: &str, raw: &str) -> AppResult<()> {
        self.parameters.bind_str(name, raw)
    }

    /// Mutable access for binding typed values.
    pub fn parameters_mut(&mut self) -> &mut ParameterSet {
        &mut self.parameters
    }
}

#[async_trait]
impl Procedure for SweepProcedure {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn metadata(&self) -> MetadataSet {
        self.metadata.clone()
    }

    fn columns(&self) -> Vec<Column> {
        vec![Column::new("Iteration"), Column::with_unit("Voltage", "V")]
    }

    async fn startup(&mut self, metadata: &mut MetadataWriter<'_>) -> anyhow::Result<()> {
        metadata.set("Start time", Utc::now().to_rfc3339())?;
        if let Ok(identity) = self.adapter.ask("*IDN?").await {
            metadata.set("Instrument", identity.trim())?;
        }
        let amplitude = self.parameters.float("Amplitude")?;
        self.adapter
            .write(&format!("SOUR:VOLT {amplitude}"))
            .await
            .context("failed to set source amplitude")?;
        Ok(())
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        let count = self.parameters.integer("Loop count")?;
        let delay = Duration::from_secs_f64(self.parameters.float("Delay")?);

        for iteration in 0..count {
            if ctx.should_stop() {
                ctx.log().info(format!("stopped after {iteration} reading(s)"));
                return Ok(());
            }
            let response = self.adapter.ask("MEAS:VOLT?").await?;
            let voltage = Quantity::parse(&response)
                .ok_or_else(|| anyhow!("unparseable reading '{response}'"))?;
            ctx.emit_results(row([
                ("Iteration", FieldValue::from(iteration)),
                ("Voltage", voltage.into()),
            ]))?;
            ctx.emit_progress(100.0 * (iteration + 1) as f64 / count as f64);

            if iteration + 1 < count {
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = ctx.stop_token().cancelled() => {}
                }
            }
        }
        Ok(())
    }

    async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.adapter.write("SOUR:VOLT 0").await
    }
}
