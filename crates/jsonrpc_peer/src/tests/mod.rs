mod support;

mod cancellation;
mod codec;
mod message;
