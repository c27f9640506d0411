use crate::proposer::{create_proposer, ProposalContext};
use anyhow::{Context, Result};
use log::info;
use std::collections::HashMap;

/// Prints a built-in template rendered as a factor spec.
pub fn run(template_id: &str, universe: Option<String>, parameters: HashMap<String, f64>) -> Result<()> {
    let proposer = create_proposer(template_id)?;
    info!("{}: {}", proposer.template_id(), proposer.description());
    let context = ProposalContext {
        universe,
        parameters,
        ..ProposalContext::default()
    };
    let spec = proposer
        .propose(&context)
        .with_context(|| format!("failed to render template {}", template_id))?;
    print!("{}", spec.to_yaml()?);
    Ok(())
}
