mod staleness;

pub use staleness::{NeverStraggler, StaleWait, StalenessClock, StalenessGate, StragglerPolicy};
