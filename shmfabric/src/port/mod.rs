//! Publish-side ports. This workspace implements only the publisher half of the pub/sub pair: a
//! [`publisher::PublisherPort`] offers chunks into [`subscriber_queue::SubscriberQueue`]s that a
//! real subscriber-side port (out of this workspace's scope) would read from and decode via
//! `RelativePointer`.

pub mod publisher;
pub mod subscriber_queue;
