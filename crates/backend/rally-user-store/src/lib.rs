pub mod error;
pub mod store;
pub mod types;

pub use error::{Result, StoreError};
pub use store::{UserStore, decode_email_key, encode_email_key};
pub use types::{
    EnrollmentRecord, PushKeys, PushSubscription, Subscriber, SubscriberStatus, SubscriberUpdate,
};
