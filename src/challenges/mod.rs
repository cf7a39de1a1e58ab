// Cloudflare challenge detection, kept for the Tier Driver layer to classify
// responses against. Automated challenge *solving* (JS execution, CAPTCHA
// submission) lives out of tree — Titan's T1 driver never executes JS, and
// T2-T5 are opaque drivers behind `crate::drivers::TierDriver`.

pub mod core;
pub mod detectors;
pub mod user_agents;
