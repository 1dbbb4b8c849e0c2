//! Entity operations over configured entities, with record validation and workflow dispatch.

mod entity;
mod validation;
mod workflow;

pub use entity::{EntityService, FindOptions, ViewOptions};
pub use validation::RecordValidator;
pub use workflow::{changed_fields, conditions_match, LoggingExecutor, WorkflowEvent, WorkflowExecutor};
