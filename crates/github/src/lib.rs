pub mod incident;
pub mod webhook;

pub use incident::{GitHubIncidentReporter, IncidentReporter};
pub use webhook::{PayloadError, PushEvent, parse_push, sign, verify};
