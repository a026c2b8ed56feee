use crate::error::MetricsError;
use crate::metrics::MetricsManager;
use crate::runtime::MetricsRuntime;

pub fn handle_commit(runtime: &MetricsRuntime) -> Result<(), MetricsError> {
    let count = runtime.manager.commit()?;
    runtime.drain();

    if count == 0 {
        println!("No metrics to commit.");
    } else {
        println!("Committed {} metric(s).", count);
    }
    Ok(())
}
