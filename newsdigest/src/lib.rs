// Library interface for the newsdigest pipeline stages
// The binary and the integration tests import these modules

pub mod abstractor;
pub mod cleaning;
pub mod extraction;
pub mod llm;
pub mod publisher;
pub mod rate_limit;
pub mod summarizer;
