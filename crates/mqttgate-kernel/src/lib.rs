pub mod codec;
pub mod template;
pub mod topic;
pub mod validate;

pub use codec::{
    decode, decode_with_limit, encode, CodecError, TooManyEntries, MAX_DECODED_ENTRIES,
};
pub use template::{replace, substitute_all, substitute_one, TemplateError};
pub use topic::{check_publish_topic, check_subscribe_filter, topic_matches, TopicError};
pub use validate::{Policy, ValidationError};
