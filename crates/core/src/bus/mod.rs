//! Typed publish/subscribe bus.
//!
//! The bus owns one [`BoundedTopic`] per event kind. Routing is resolved
//! through the sealed [`BusEvent`] trait, so publishing a type that has no
//! topic does not compile.

pub mod dispatcher;
pub mod topic;

use std::fmt;

use once_cell::sync::OnceCell;

use crate::config::QueueConfig;
use crate::events::{AnimCmd, AudioFrame, BeatEvent, ButtonEvent, FeatureFrame, TickEvent};
use crate::Result;

pub use dispatcher::{DispatchOutcome, Dispatcher, DispatcherHandle};
pub use topic::{BoundedTopic, OverflowPolicy, Timeout};

/// Topic storage for every registered event kind.
pub struct TopicSet {
    audio: BoundedTopic<AudioFrame>,
    feature: BoundedTopic<FeatureFrame>,
    beat: BoundedTopic<BeatEvent>,
    tick: BoundedTopic<TickEvent>,
    anim_cmd: BoundedTopic<AnimCmd>,
    button: BoundedTopic<ButtonEvent>,
}

impl TopicSet {
    fn new(queues: &QueueConfig) -> Self {
        Self {
            audio: BoundedTopic::new(AudioFrame::TOPIC, queues.audio, AudioFrame::POLICY),
            feature: BoundedTopic::new(FeatureFrame::TOPIC, queues.feature, FeatureFrame::POLICY),
            beat: BoundedTopic::new(BeatEvent::TOPIC, queues.beat, BeatEvent::POLICY),
            tick: BoundedTopic::new(TickEvent::TOPIC, queues.tick, TickEvent::POLICY),
            anim_cmd: BoundedTopic::new(AnimCmd::TOPIC, queues.anim_cmd, AnimCmd::POLICY),
            button: BoundedTopic::new(ButtonEvent::TOPIC, queues.button, ButtonEvent::POLICY),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// An event type with a topic on the [`EventBus`].
///
/// Sealed: the set of routable events is closed and fixed by this crate.
pub trait BusEvent: Copy + Send + fmt::Debug + sealed::Sealed + 'static {
    /// Topic name used in diagnostics.
    const TOPIC: &'static str;
    /// Overflow policy of the topic carrying this event.
    const POLICY: OverflowPolicy;

    #[doc(hidden)]
    fn topic(topics: &TopicSet) -> &BoundedTopic<Self>;
}

macro_rules! route {
    ($event:ty, $field:ident, $name:literal, $policy:expr) => {
        impl sealed::Sealed for $event {}

        impl BusEvent for $event {
            const TOPIC: &'static str = $name;
            const POLICY: OverflowPolicy = $policy;

            fn topic(topics: &TopicSet) -> &BoundedTopic<Self> {
                &topics.$field
            }
        }
    };
}

// Sampling must never stall on a slow consumer; user commands must never
// be lost.
route!(AudioFrame, audio, "AUDIO_FRAME", OverflowPolicy::DropOldest);
route!(FeatureFrame, feature, "FEATURE_FRAME", OverflowPolicy::DropNewest);
route!(BeatEvent, beat, "BEAT_EVENT", OverflowPolicy::DropOldest);
route!(TickEvent, tick, "TICK_EVENT", OverflowPolicy::DropOldest);
route!(AnimCmd, anim_cmd, "ANIM_CMD", OverflowPolicy::Block);
route!(ButtonEvent, button, "BUTTON_EVENT", OverflowPolicy::DropOldest);

/// Registry of topics shared by every pipeline component.
///
/// Construct one instance and hand it out by `Arc`. Topics are built by the
/// first call to [`EventBus::initialize`] (or lazily on first use); later
/// calls are no-ops, so capacity and policy never change afterwards.
pub struct EventBus {
    queues: QueueConfig,
    topics: OnceCell<TopicSet>,
}

impl EventBus {
    /// Validates the queue depths. No topic is allocated until
    /// initialization.
    pub fn new(queues: QueueConfig) -> Result<Self> {
        queues.validate()?;
        Ok(Self {
            queues,
            topics: OnceCell::new(),
        })
    }

    /// Builds the topics. Returns `true` only for the call that performed
    /// the initialization.
    pub fn initialize(&self) -> bool {
        let mut created = false;
        self.topics.get_or_init(|| {
            created = true;
            TopicSet::new(&self.queues)
        });
        if created {
            tracing::debug!(queues = ?self.queues, "event bus initialized");
        }
        created
    }

    pub fn is_initialized(&self) -> bool {
        self.topics.get().is_some()
    }

    /// Publishes a copy of `event` on its topic.
    pub fn publish<T: BusEvent>(&self, event: T, timeout: Timeout) -> bool {
        self.topic::<T>().publish(event, timeout)
    }

    /// Publishes without waiting, the default for hot paths.
    pub fn publish_now<T: BusEvent>(&self, event: T) -> bool {
        self.publish(event, Timeout::NoWait)
    }

    /// Takes the oldest pending `T`, waiting up to `timeout`.
    pub fn subscribe<T: BusEvent>(&self, timeout: Timeout) -> Option<T> {
        self.topic::<T>().subscribe(timeout)
    }

    pub fn try_subscribe<T: BusEvent>(&self) -> Option<T> {
        self.subscribe(Timeout::NoWait)
    }

    /// Direct access to the topic of `T`, for diagnostics and shutdown.
    pub fn topic<T: BusEvent>(&self) -> &BoundedTopic<T> {
        T::topic(self.topics())
    }

    /// Empties every topic.
    pub fn purge_all(&self) {
        if let Some(topics) = self.topics.get() {
            topics.audio.purge();
            topics.feature.purge();
            topics.beat.purge();
            topics.tick.purge();
            topics.anim_cmd.purge();
            topics.button.purge();
        }
    }

    fn topics(&self) -> &TopicSet {
        self.topics.get_or_init(|| TopicSet::new(&self.queues))
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("queues", &self.queues)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}
