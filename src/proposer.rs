use crate::models::{FactorSpec, TargetsDef, ValidationDef};
use anyhow::{anyhow, Result};
use std::collections::HashMap;

/// Overrides applied to a template when it is turned into a concrete spec.
#[derive(Debug, Clone, Default)]
pub struct ProposalContext {
    pub universe: Option<String>,
    pub targets: Option<TargetsDef>,
    pub validation: Option<ValidationDef>,
    /// Template parameters such as `lookback` or `vol_window`.
    pub parameters: HashMap<String, f64>,
}

/// Source of candidate factor specs.
pub trait FactorProposer {
    fn template_id(&self) -> &str;
    fn description(&self) -> &str;
    /// YAML factor spec with `${name}` placeholders.
    fn template(&self) -> &str;
    fn default_parameters(&self) -> &[(&'static str, f64)];

    fn propose(&self, context: &ProposalContext) -> Result<FactorSpec> {
        render_template(self.template(), self.default_parameters(), context)
    }
}

#[path = "recipes/tsmom.rs"]
pub mod tsmom;

pub use tsmom::TimeSeriesMomentum;

#[path = "recipes/low_volatility.rs"]
pub mod low_volatility;

pub use low_volatility::LowVolatility;

#[path = "recipes/short_term_reversal.rs"]
pub mod short_term_reversal;

pub use short_term_reversal::ShortTermReversal;

#[path = "recipes/vol_scaled_momentum.rs"]
pub mod vol_scaled_momentum;

pub use vol_scaled_momentum::VolScaledMomentum;

pub const TEMPLATE_IDS: [&str; 4] = [
    "tsmom",
    "low_volatility",
    "short_term_reversal",
    "vol_scaled_momentum",
];

pub fn create_proposer(template_id: &str) -> Result<Box<dyn FactorProposer + Send + Sync>> {
    match template_id {
        "tsmom" => Ok(Box::new(TimeSeriesMomentum::new())),
        "low_volatility" | "low_vol" => Ok(Box::new(LowVolatility::new())),
        "short_term_reversal" => Ok(Box::new(ShortTermReversal::new())),
        "vol_scaled_momentum" => Ok(Box::new(VolScaledMomentum::new())),
        _ => Err(anyhow!("Unknown factor template: {}", template_id)),
    }
}

/// Substitutes parameters into a template, parses it and applies the
/// context overrides.
pub fn render_template(
    template: &str,
    defaults: &[(&'static str, f64)],
    context: &ProposalContext,
) -> Result<FactorSpec> {
    let mut values: Vec<(&str, f64)> = defaults.to_vec();
    for (key, value) in &context.parameters {
        let slot = values
            .iter_mut()
            .find(|(name, _)| *name == key.as_str())
            .ok_or_else(|| anyhow!("Unknown template parameter: {}", key))?;
        if !(value.is_finite() && *value > 0.0) {
            return Err(anyhow!(
                "Template parameter {} must be > 0 (value: {})",
                key,
                value
            ));
        }
        slot.1 = *value;
    }

    let mut text = template.to_string();
    for (name, value) in &values {
        text = text.replace(&format!("${{{}}}", name), &value.to_string());
    }
    if let Some(start) = text.find("${") {
        let placeholder: String = text[start..].chars().take_while(|c| *c != '}').collect();
        return Err(anyhow!("Template placeholder {}}} has no value", placeholder));
    }

    let mut spec = FactorSpec::from_yaml(&text)?;
    if let Some(universe) = &context.universe {
        spec.universe = universe.clone();
    }
    if let Some(targets) = &context.targets {
        spec.targets = targets.clone();
    }
    if let Some(validation) = &context.validation {
        spec.validation = validation.clone();
    }
    spec.validate()?;
    Ok(spec)
}
