pub mod health;
pub mod lifecycle;
pub mod orchestrator;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_support;
