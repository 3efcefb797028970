//! Queue backends.
//!
//! Each backend implements [`QueueBackend`](crate::registry::QueueBackend)
//! for one or more URI schemes:
//!
//! - [`memory`] - `mem://`, in-process channels for tests and local runs
//! - [`sqs`] - `sqs://<queue-name>`, AWS SQS over the query API
//! - [`nsq`] - `nsqd://` and `nsqlookupd://`, NSQ topics and channels

pub mod memory;
pub mod nsq;
pub mod nsq_client;
pub mod sqs;
pub mod sqs_http;

pub use memory::{MemoryBackend, MemoryBroker, MEMORY_SCHEME};
pub use nsq::{
    NsqBackend, NsqConnector, NsqConsumer, NsqEndpoint, NsqMessageHandler, NsqProducer,
    NSQD_SCHEME, NSQLOOKUPD_SCHEME,
};
pub use nsq_client::NsqClient;
pub use sqs::{SqsApi, SqsBackend, SqsMessage, SQS_SCHEME};
pub use sqs_http::{SqsError, SqsHttpClient};
