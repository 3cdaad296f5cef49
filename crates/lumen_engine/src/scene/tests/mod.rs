//! Whole-frame tests driving [`crate::scene::Scene`] against the recording device
