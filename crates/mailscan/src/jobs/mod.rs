pub mod dispatcher;
pub mod model;
pub mod store;

pub use dispatcher::{DispatchFault, DispatchSettings, JobDispatcher, Outcome};
pub use model::{AttachmentMetadata, Job, JobPayload, JobStatus, PayloadError};
pub use store::{JobStore, PgJobStore, StoreError};
