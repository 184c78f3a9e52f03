//! Water level resolution and ingestion.
//!
//! A task cannot be built without a water level for its video. Levels come
//! from, in order: the local time series, a flat file dropped next to the
//! videos, or a periodic site-specific script.

mod resolver;
mod script;

pub use resolver::{WaterLevelError, WaterLevelResolver};
pub use script::{run_water_level_ingest, run_water_level_script, SCRIPT_OUTPUT_FMT};
