//! Results files written by real jobs and read back with `Results::load`.

mod common;

use async_trait::async_trait;
use common::ScriptedProcedure;
use daq_runner::bus::{EventBus, Filter};
use daq_runner::config::ManagerSettings;
use daq_runner::job::Job;
use daq_runner::manager::Manager;
use daq_runner::messages::{row, FieldValue, LogLevel, Payload, Topic};
use daq_runner::parameter::{Parameter, ParameterSet};
use daq_runner::procedure::{Column, ExecutionContext, Procedure, Status};
use daq_runner::procedures::SweepProcedure;
use daq_runner::results::Results;
use daq_runner::units::Quantity;

/// Emits the rows it was constructed with, verbatim.
struct Replay {
    parameters: ParameterSet,
    rows: Vec<Vec<(&'static str, FieldValue)>>,
}

#[async_trait]
impl Procedure for Replay {
    fn name(&self) -> &str {
        "Replay"
    }

    fn parameters(&self) -> &ParameterSet {
        &self.parameters
    }

    fn columns(&self) -> Vec<Column> {
        vec![Column::new("Label"), Column::with_unit("Voltage", "V")]
    }

    async fn execute(&mut self, ctx: &ExecutionContext) -> anyhow::Result<()> {
        for fields in self.rows.drain(..) {
            ctx.emit_results(row(fields))?;
        }
        Ok(())
    }
}

fn typed_parameters() -> ParameterSet {
    ParameterSet::from_parameters([
        Parameter::integer("Averages", 4),
        Parameter::float("Frequency", 1_000.0).with_unit("Hz"),
        Parameter::boolean("Autorange", true),
        Parameter::text("Sample", "GaAs #7"),
        Parameter::vector("Offsets", vec![0.0, 0.0]),
        Parameter::list("Range", &["1V", "10V", "100V"], "10V"),
    ])
    .unwrap()
}

#[tokio::test]
async fn test_header_round_trip_restores_typed_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("header.csv");

    let mut parameters = typed_parameters();
    parameters.set("Averages", 16).unwrap();
    parameters.bind_str("Frequency", "2.5e-3").unwrap();
    parameters.set("Autorange", false).unwrap();
    // Text that the header could not give back verbatim is refused at bind time.
    assert!(parameters.set("Sample", "  padded  ").is_err());
    parameters.set("Sample", "Si:  doped,  3 mm").unwrap();
    parameters.set("Offsets", vec![1.5, -2.25]).unwrap();
    parameters.set("Range", "100V").unwrap();

    let procedure = Replay {
        parameters: parameters.clone(),
        rows: Vec::new(),
    };
    Results::create(&path, &procedure).unwrap().finish().unwrap();

    let loaded = Results::load(&path).unwrap();
    assert_eq!(loaded.procedure, "Replay");
    assert_eq!(loaded.parameter("Frequency"), Some("0.0025 Hz"));

    let mut restored = typed_parameters();
    loaded.restore_into(&mut restored).unwrap();
    for parameter in parameters.iter() {
        assert_eq!(
            restored.value(parameter.name()),
            Some(parameter.value()),
            "{} did not survive the round trip",
            parameter.name()
        );
    }
}

#[tokio::test]
async fn test_unit_mismatch_stores_nan_and_warns() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("units.csv");
    let bus = EventBus::local();
    let manager = Manager::spawn(ManagerSettings::default(), bus.clone());
    let mut logs = bus.subscribe(Filter::all().topics([Topic::Log]));

    let procedure = Replay {
        parameters: ParameterSet::new(),
        rows: vec![
            vec![("Label", "plain".into()), ("Voltage", 1.25.into())],
            vec![("Label", "milli".into()), ("Voltage", Quantity::new(250.0, "mV").into())],
            vec![("Label", "amps".into()), ("Voltage", Quantity::new(3.0, "A").into())],
            vec![("Label", "kilo".into()), ("Voltage", "0.002 kV".into())],
        ],
    };
    let mut handle = manager.queue(Job::create(procedure, &path).unwrap()).await.unwrap();
    assert_eq!(handle.wait().await, Some(Status::Finished));

    let loaded = Results::load(&path).unwrap();
    assert_eq!(loaded.row_count(), 4);
    let voltages = loaded.numeric_column("Voltage").unwrap();
    assert_eq!(voltages[0], 1.25);
    assert_eq!(voltages[1], 0.25);
    assert!(voltages[2].is_nan());
    assert_eq!(voltages[3], 2.0);

    let mut warnings = Vec::new();
    while let Some(message) = logs.try_recv() {
        if let Payload::Log(record) = message.payload {
            if record.level == LogLevel::Warn {
                warnings.push(record.message);
            }
        }
    }
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("'A'"));
}

#[tokio::test]
async fn test_sweep_file_loads_without_rerunning() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sweep.csv");
    let manager = Manager::spawn(ManagerSettings::default(), EventBus::local());

    let mut sweep = SweepProcedure::simulated().unwrap();
    sweep.bind("Loop count", "4").unwrap();
    sweep.bind("Delay", "0").unwrap();
    let mut handle = manager.queue(Job::create(sweep, &path).unwrap()).await.unwrap();
    assert_eq!(handle.wait().await, Some(Status::Finished));

    let loaded = Results::load(&path).unwrap();
    assert_eq!(loaded.procedure, SweepProcedure::NAME);
    assert_eq!(loaded.parameter("Loop count"), Some("4"));
    assert!(loaded.metadata_value("Start time").is_some());
    assert_eq!(
        loaded.metadata_value("Instrument"),
        Some("MOCK,VOLTMETER,0,1.0")
    );
    let labels: Vec<String> = loaded.columns.iter().map(Column::label).collect();
    assert_eq!(labels, ["Iteration", "Voltage (V)"]);

    // Readings arrive in mV and are stored in V.
    let voltages = loaded.numeric_column("Voltage").unwrap();
    assert_eq!(voltages.len(), 4);
    assert!((voltages[0] - 0.1125).abs() < 1e-12);
    assert!(voltages.windows(2).all(|w| w[1] > w[0]));

    let mut restored = SweepProcedure::simulated().unwrap();
    loaded.restore_into(restored.parameters_mut()).unwrap();
    assert_eq!(restored.parameters().integer("Loop count").unwrap(), 4);
}

#[tokio::test]
async fn test_rows_follow_emission_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("order.csv");
    let manager = Manager::spawn(ManagerSettings::default(), EventBus::local());

    let mut handle = manager
        .queue(Job::create(ScriptedProcedure::new("order", 250), &path).unwrap())
        .await
        .unwrap();
    assert_eq!(handle.wait().await, Some(Status::Finished));

    let loaded = Results::load(&path).unwrap();
    let iterations = loaded.numeric_column("Iteration").unwrap();
    let expected: Vec<f64> = (0..250).map(f64::from).collect();
    assert_eq!(iterations, expected);
}
