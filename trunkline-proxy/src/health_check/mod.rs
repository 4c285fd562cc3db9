//! Active health checking of server group elements.

pub mod monitor;
pub mod probe;

pub use monitor::{CycleReport, OptionsPingMonitor, Pipeline};
pub use probe::{options_request, send_probe, ProbeResult};
