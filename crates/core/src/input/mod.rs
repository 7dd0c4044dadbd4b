use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::bus::{Dispatcher, EventBus, Timeout};
use crate::config::InputConfig;
use crate::events::{AnimCmd, AnimCmdType, ButtonEvent, ButtonState, Timestamp};

/// Classifies debounced button levels into press and release events.
#[derive(Debug, Clone)]
pub struct ButtonTracker {
    long_press: Duration,
    level: bool,
    pressed_at: Timestamp,
}

impl ButtonTracker {
    pub fn new(long_press: Duration) -> Self {
        Self {
            long_press,
            level: false,
            pressed_at: Timestamp::default(),
        }
    }

    pub fn from_config(config: &InputConfig) -> Self {
        Self::new(Duration::from_millis(u64::from(config.long_press_ms)))
    }

    /// Feeds the current level (`true` = pressed). Repeated levels are
    /// ignored; a release reports how long the button was held.
    pub fn on_level(&mut self, level: bool, now: Timestamp) -> Option<ButtonState> {
        if level == self.level {
            return None;
        }
        self.level = level;

        if level {
            self.pressed_at = now;
            return Some(ButtonState::Pressed);
        }

        let held = Duration::from_nanos(now.saturating_sub(self.pressed_at).nanoseconds);
        if held <= self.long_press {
            Some(ButtonState::ReleasedShort)
        } else {
            Some(ButtonState::ReleasedLong)
        }
    }

    pub fn is_pressed(&self) -> bool {
        self.level
    }
}

/// Publishes button transitions on the bus.
#[derive(Debug)]
pub struct InputModule {
    bus: Arc<EventBus>,
    tracker: ButtonTracker,
    origin: Instant,
}

impl InputModule {
    pub fn new(bus: Arc<EventBus>, config: &InputConfig, origin: Instant) -> Self {
        Self {
            bus,
            tracker: ButtonTracker::from_config(config),
            origin,
        }
    }

    /// Feeds a level sampled now.
    pub fn on_level(&mut self, level: bool) -> Option<ButtonEvent> {
        self.on_level_at(level, Timestamp::since(self.origin))
    }

    pub fn on_level_at(&mut self, level: bool, ts: Timestamp) -> Option<ButtonEvent> {
        let state = self.tracker.on_level(level, ts)?;
        let event = ButtonEvent { ts, state };
        tracing::info!(target: "input", ?state, "button event");
        if !self.bus.publish_now(event) {
            tracing::error!(target: "input", "failed to publish button event");
        }
        Some(event)
    }
}

/// Translates button releases into animation commands.
///
/// A short press selects the next animation and a long press the previous
/// one. Commands go to the blocking command topic and wait up to the
/// configured timeout for space.
#[derive(Debug)]
pub struct CommandMapper {
    bus: Arc<EventBus>,
    timeout: Timeout,
    sent: u64,
    timed_out: u64,
}

impl CommandMapper {
    pub fn new(bus: Arc<EventBus>, config: &InputConfig) -> Self {
        Self {
            bus,
            timeout: Timeout::from_millis(config.command_timeout_ms),
            sent: 0,
            timed_out: 0,
        }
    }

    pub fn command_for(state: ButtonState) -> Option<AnimCmdType> {
        match state {
            ButtonState::Pressed => None,
            ButtonState::ReleasedShort => Some(AnimCmdType::Next),
            ButtonState::ReleasedLong => Some(AnimCmdType::Prev),
        }
    }

    /// Returns the command that was published, if any.
    pub fn handle(&mut self, event: &ButtonEvent) -> Option<AnimCmd> {
        let kind = Self::command_for(event.state)?;
        let cmd = AnimCmd::new(event.ts, kind, 0);
        if self.bus.publish(cmd, self.timeout) {
            self.sent += 1;
            Some(cmd)
        } else {
            self.timed_out += 1;
            tracing::warn!(target: "input", ?kind, "command queue full, command not sent");
            None
        }
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out
    }

    pub fn attach(mut self, dispatcher: &mut Dispatcher) {
        dispatcher.on::<ButtonEvent, _>(move |event| {
            self.handle(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(QueueConfig::default()).unwrap())
    }

    #[test]
    fn classifies_short_and_long_presses() {
        let mut tracker = ButtonTracker::new(Duration::from_millis(2_000));
        assert_eq!(
            tracker.on_level(true, Timestamp::from_millis(100)),
            Some(ButtonState::Pressed)
        );
        assert_eq!(tracker.on_level(true, Timestamp::from_millis(150)), None);
        assert_eq!(
            tracker.on_level(false, Timestamp::from_millis(2_100)),
            Some(ButtonState::ReleasedShort)
        );

        tracker.on_level(true, Timestamp::from_millis(3_000));
        assert_eq!(
            tracker.on_level(false, Timestamp::from_millis(5_001)),
            Some(ButtonState::ReleasedLong)
        );
        assert!(!tracker.is_pressed());
    }

    #[test]
    fn release_without_press_is_ignored() {
        let mut tracker = ButtonTracker::from_config(&InputConfig::default());
        assert_eq!(tracker.on_level(false, Timestamp::from_millis(10)), None);
    }

    #[test]
    fn input_module_publishes_transitions() {
        let bus = bus();
        let mut input = InputModule::new(bus.clone(), &InputConfig::default(), Instant::now());
        input.on_level_at(true, Timestamp::from_millis(0));
        input.on_level_at(false, Timestamp::from_millis(300));

        let states: Vec<_> = std::iter::from_fn(|| bus.try_subscribe::<ButtonEvent>())
            .map(|event| event.state)
            .collect();
        assert_eq!(states, vec![ButtonState::Pressed, ButtonState::ReleasedShort]);
    }

    #[test]
    fn maps_releases_to_commands() {
        let bus = bus();
        let mut mapper = CommandMapper::new(bus.clone(), &InputConfig::default());
        let press = |state| ButtonEvent {
            ts: Timestamp::from_millis(1),
            state,
        };

        assert_eq!(mapper.handle(&press(ButtonState::Pressed)), None);
        assert_eq!(
            mapper.handle(&press(ButtonState::ReleasedShort)).map(|cmd| cmd.kind),
            Some(AnimCmdType::Next)
        );
        assert_eq!(
            mapper.handle(&press(ButtonState::ReleasedLong)).map(|cmd| cmd.kind),
            Some(AnimCmdType::Prev)
        );
        assert_eq!(bus.topic::<AnimCmd>().pending(), 2);
        assert_eq!(mapper.sent(), 2);
    }

    #[test]
    fn full_command_queue_times_out() {
        let bus = bus();
        let config = InputConfig {
            command_timeout_ms: 1,
            ..InputConfig::default()
        };
        let mut mapper = CommandMapper::new(bus.clone(), &config);
        let release = ButtonEvent {
            ts: Timestamp::from_millis(1),
            state: ButtonState::ReleasedShort,
        };
        for _ in 0..QueueConfig::default().anim_cmd {
            assert!(mapper.handle(&release).is_some());
        }
        assert!(mapper.handle(&release).is_none());
        assert_eq!(mapper.timed_out(), 1);
    }
}
