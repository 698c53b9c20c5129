//! Cross-crate scenarios.

#[cfg(test)]
mod directory_flows;
#[cfg(test)]
mod persistence_flows;
