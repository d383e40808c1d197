//! Core library for the daq_runner measurement engine.
//!
//! A [`Procedure`](procedure::Procedure) describes one measurement: typed
//! parameters, metadata, an output column schema and an async
//! `startup`/`execute`/`shutdown` lifecycle. Bundled with a
//! [`Results`](results::Results) file into a [`Job`](job::Job), it is queued on a
//! [`Manager`](manager::Manager), which runs one job at a time on its own task.
//! Workers report status, progress, rows and log records on an
//! [`EventBus`](bus::EventBus); a recorder task persists the rows.
//!
//! ```no_run
//! use daq_runner::{bus::EventBus, config::Settings, job::Job, manager::Manager};
//! use daq_runner::procedures::SweepProcedure;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let settings = Settings::default();
//! let manager = Manager::spawn(settings.manager.clone(), EventBus::local());
//!
//! let mut sweep = SweepProcedure::simulated()?;
//! sweep.bind("Loop count", "5")?;
//! let mut handle = manager.queue(Job::create(sweep, "data/DATA1.csv")?).await?;
//! println!("finished with {:?}", handle.wait().await);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod bus;
pub mod config;
pub mod error;
pub mod job;
pub mod logging;
pub mod manager;
pub mod messages;
pub mod metadata;
pub mod parameter;
pub mod procedure;
pub mod procedures;
pub mod recorder;
pub mod results;
pub mod units;
pub mod worker;

pub use error::{AppResult, DaqError};
pub use procedure::{Column, ExecutionContext, Procedure, Status};
