//! Bridges from in-process signals to gateway topics.

use crate::gateway::Gateway;
use cadence_core::{ReferenceResolver, Signal, SlotId, Song};
use std::sync::Arc;

pub const LIVE_LYRIC_TOPIC: &str = "live_lyric";
pub const NOW_PLAYING_TOPIC: &str = "now_playing";

type Render<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

/// Republishes payloads of type `T` on one gateway topic.
///
/// `render` turns a payload into the frame text; returning `None` skips it.
pub struct Publisher<T> {
    topic: String,
    gateway: Gateway,
    render: Render<T>,
}

impl<T> std::fmt::Debug for Publisher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Publisher<T> {
    /// Declares `topic` on the gateway.
    pub fn new<F>(gateway: &Gateway, topic: impl Into<String>, render: F) -> Self
    where
        F: Fn(&T) -> Option<String> + Send + Sync + 'static,
    {
        let topic = topic.into();
        gateway.declare_topic(&topic);
        Self {
            topic,
            gateway: gateway.clone(),
            render: Box::new(render),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Returns how many subscribers received the payload.
    pub fn publish(&self, payload: &T) -> usize {
        match (self.render)(payload) {
            Some(text) => self.gateway.publish(&self.topic, &text),
            None => 0,
        }
    }

    /// Forward every emission of `signal`. The connection lapses once the
    /// publisher is dropped.
    pub fn bridge(self: &Arc<Self>, signal: &Signal<T>) -> SlotId {
        tracing::debug!(topic = %self.topic, signal = signal.name(), "bridging signal to gateway");
        signal.connect_weak(self, |publisher: &Publisher<T>, payload: &T| {
            publisher.publish(payload);
            Ok(())
        })
    }
}

/// Publishes lyric sentences verbatim.
pub fn live_lyric_publisher(gateway: &Gateway) -> Publisher<String> {
    Publisher::new(gateway, LIVE_LYRIC_TOPIC, |sentence: &String| {
        Some(sentence.clone())
    })
}

/// Publishes the reference of the new current song, or an empty payload
/// when nothing is current.
pub fn now_playing_publisher(
    gateway: &Gateway,
    resolver: Arc<dyn ReferenceResolver>,
) -> Publisher<Option<Song>> {
    Publisher::new(gateway, NOW_PLAYING_TOPIC, move |song: &Option<Song>| {
        let Some(song) = song else {
            return Some(String::new());
        };
        match resolver.reverse(song) {
            Ok(reference) => Some(reference),
            Err(err) => {
                tracing::debug!(song = %song.describe(), error = %err, "not publishing unexportable song");
                None
            }
        }
    })
}
