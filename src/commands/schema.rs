use schemars::schema_for;

use crate::config::MergeQueueConfig;

/// Print the JSON Schema for the rig's merge_queue config section.
pub fn run_schema() -> anyhow::Result<()> {
    let schema = schema_for!(MergeQueueConfig);
    let json = serde_json::to_string_pretty(&schema)?;
    println!("{json}");
    Ok(())
}
