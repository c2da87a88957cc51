//! Natives available to scripts. A host picks the libraries it wants and
//! registers them into the namespace its scripts run in.
pub mod core;

use crate::runtime::value::Value;

/// Argument `i`, nil when absent.
pub(crate) fn arg(args: &[Value], i: usize) -> Value {
    args.get(i).cloned().unwrap_or_default()
}
