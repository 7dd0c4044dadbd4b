//! Rendering consumer: animation selection, beat holdoff and the frame
//! clock.
//!
//! The pixel output itself sits behind the [`Animator`] trait.
//! [`AnimationControl`] decides *what* is shown and when a beat reaches the
//! animation; the animator decides how it looks.

use std::{
    fmt,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::bus::{Dispatcher, EventBus};
use crate::config::RenderConfig;
use crate::events::{AnimCmd, AnimCmdType, BeatEvent, TickEvent, Timestamp};
use crate::sampling::{PeriodicTimer, TimerHandle};
use crate::{BeatlightError, Result};

/// Ticks between automatic animation changes while cycling.
pub const CYCLE_TICKS: u64 = 1_000;

/// Output side of the renderer.
pub trait Animator: Send {
    /// The active animation changed.
    fn select(&mut self, index: usize, name: &str);
    /// An accepted beat for the active animation.
    fn beat(&mut self, ts: Timestamp);
    /// Draws frame number `frame` at `brightness` percent.
    fn frame(&mut self, frame: u64, brightness: u16);
}

/// Catalog id of an animation name: 32-bit FNV-1a folded to 16 bits.
pub fn catalog_id(name: &str) -> u16 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    ((hash >> 16) ^ (hash & 0xffff)) as u16
}

/// Selects the active animation and filters beats before they reach the
/// [`Animator`].
pub struct AnimationControl<A> {
    names: Vec<String>,
    ids: Vec<u16>,
    current: usize,
    cycling: bool,
    cycle_ticks: u64,
    frame: u64,
    brightness: u16,
    holdoff: Duration,
    last_beat: Option<Timestamp>,
    accepted_beats: u64,
    suppressed_beats: u64,
    animator: A,
}

impl<A: Animator> AnimationControl<A> {
    pub fn new(config: &RenderConfig, mut animator: A) -> Result<Self> {
        if config.animations.is_empty() {
            return Err(BeatlightError::InvalidConfig(
                "render.animations must name at least one animation".into(),
            ));
        }
        let names = config.animations.clone();
        let ids: Vec<u16> = names.iter().map(|name| catalog_id(name)).collect();
        for (i, id) in ids.iter().enumerate() {
            if ids[..i].contains(id) {
                tracing::warn!(target: "render", name = %names[i], id, "catalog id collision");
            }
        }

        animator.select(0, &names[0]);
        Ok(Self {
            names,
            ids,
            current: 0,
            cycling: false,
            cycle_ticks: 0,
            frame: 0,
            brightness: config.brightness.min(100),
            holdoff: Duration::from_millis(u64::from(config.beat_holdoff_ms)),
            last_beat: None,
            accepted_beats: 0,
            suppressed_beats: 0,
            animator,
        })
    }

    /// Forwards a beat unless it falls within the holdoff of the last
    /// accepted one.
    pub fn on_beat(&mut self, beat: &BeatEvent) -> bool {
        if let Some(last) = self.last_beat {
            let since = Duration::from_nanos(beat.ts.saturating_sub(last).nanoseconds);
            if since < self.holdoff {
                self.suppressed_beats += 1;
                return false;
            }
        }
        self.last_beat = Some(beat.ts);
        self.accepted_beats += 1;
        self.animator.beat(beat.ts);
        true
    }

    /// Advances one frame, auto-cycling if enabled.
    pub fn on_tick(&mut self, _tick: &TickEvent) {
        if self.cycling {
            self.cycle_ticks += 1;
            if self.cycle_ticks >= CYCLE_TICKS {
                self.cycle_ticks = 0;
                let next = (self.current + 1) % self.names.len();
                self.activate(next);
            }
        }
        self.animator.frame(self.frame, self.brightness);
        self.frame += 1;
    }

    /// Applies a command. Returns `false` if it was ignored.
    pub fn apply(&mut self, cmd: &AnimCmd) -> bool {
        match cmd.kind {
            AnimCmdType::Next => {
                self.next();
                true
            }
            AnimCmdType::Prev => {
                self.prev();
                true
            }
            AnimCmdType::SetIndex => self.select(usize::from(cmd.value)),
            AnimCmdType::SetName => self.select_by_id(cmd.value),
            AnimCmdType::Brightness => {
                self.brightness = cmd.value.min(100);
                true
            }
        }
    }

    /// Moves to the next animation. Wrapping past the last one starts
    /// auto-cycling from the first.
    pub fn next(&mut self) {
        if self.current + 1 >= self.names.len() {
            self.cycling = true;
            self.cycle_ticks = 0;
            self.activate(0);
        } else {
            self.cycling = false;
            self.activate(self.current + 1);
        }
    }

    pub fn prev(&mut self) {
        self.cycling = false;
        let index = self.current.checked_sub(1).unwrap_or(self.names.len() - 1);
        self.activate(index);
    }

    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.names.len() {
            tracing::warn!(target: "render", index, "no animation at index");
            return false;
        }
        self.cycling = false;
        self.activate(index);
        true
    }

    pub fn select_by_id(&mut self, id: u16) -> bool {
        match self.ids.iter().position(|candidate| *candidate == id) {
            Some(index) => self.select(index),
            None => {
                tracing::warn!(target: "render", id, "unknown animation id");
                false
            }
        }
    }

    fn activate(&mut self, index: usize) {
        self.current = index;
        tracing::info!(target: "render", index, name = %self.names[index], "animation selected");
        self.animator.select(index, &self.names[index]);
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current_name(&self) -> &str {
        &self.names[self.current]
    }

    pub fn is_cycling(&self) -> bool {
        self.cycling
    }

    pub fn brightness(&self) -> u16 {
        self.brightness
    }

    pub fn frame_count(&self) -> u64 {
        self.frame
    }

    pub fn accepted_beats(&self) -> u64 {
        self.accepted_beats
    }

    pub fn suppressed_beats(&self) -> u64 {
        self.suppressed_beats
    }

    pub fn animator(&self) -> &A {
        &self.animator
    }
}

impl<A> fmt::Debug for AnimationControl<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationControl")
            .field("current", &self.names.get(self.current))
            .field("cycling", &self.cycling)
            .field("frame", &self.frame)
            .field("brightness", &self.brightness)
            .field("accepted_beats", &self.accepted_beats)
            .field("suppressed_beats", &self.suppressed_beats)
            .finish()
    }
}

/// Shared, thread-safe view over an [`AnimationControl`].
pub struct AnimationHandle<A> {
    shared: Arc<Mutex<AnimationControl<A>>>,
}

impl<A> Clone for AnimationHandle<A> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<A: Animator + 'static> AnimationHandle<A> {
    pub fn new(control: AnimationControl<A>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(control)),
        }
    }

    /// Runs `f` with exclusive access to the control.
    pub fn with<R>(&self, f: impl FnOnce(&mut AnimationControl<A>) -> R) -> R {
        f(&mut self.shared.lock())
    }

    /// Subscribes the control to beats, ticks and commands on `dispatcher`.
    ///
    /// Ticks never wait for the lock: a frame is skipped while a beat or
    /// command is being applied.
    pub fn attach(&self, dispatcher: &mut Dispatcher) {
        let beats = self.clone();
        dispatcher.on::<BeatEvent, _>(move |beat| {
            beats.with(|control| control.on_beat(beat));
        });

        let ticks = self.clone();
        dispatcher.on::<TickEvent, _>(move |tick| match ticks.shared.try_lock() {
            Some(mut control) => control.on_tick(tick),
            None => tracing::trace!(target: "render", "renderer busy, frame skipped"),
        });

        let commands = self.clone();
        dispatcher.on::<AnimCmd, _>(move |cmd| {
            commands.with(|control| control.apply(cmd));
        });
    }

    /// Non-blocking variant of [`with`](Self::with); `None` while another
    /// thread holds the control.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut AnimationControl<A>) -> R) -> Option<R> {
        self.shared.try_lock().map(|mut control| f(&mut control))
    }
}

impl<A> fmt::Debug for AnimationHandle<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnimationHandle").finish()
    }
}

/// Animator that only reports what it would draw.
#[derive(Debug, Default)]
pub struct LoggingAnimator {
    current: Option<String>,
    beats: u64,
    frames: u64,
}

impl LoggingAnimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }
}

impl Animator for LoggingAnimator {
    fn select(&mut self, index: usize, name: &str) {
        tracing::debug!(target: "render", index, name, "animator switched");
        self.current = Some(name.to_owned());
    }

    fn beat(&mut self, ts: Timestamp) {
        self.beats += 1;
        tracing::info!(
            target: "render",
            animation = self.current.as_deref().unwrap_or("-"),
            ts_ms = ts.as_millis(),
            "beat"
        );
    }

    fn frame(&mut self, _frame: u64, _brightness: u16) {
        self.frames += 1;
    }
}

/// Publishes a [`TickEvent`] at `fps` frames per second.
pub fn spawn_frame_clock(bus: Arc<EventBus>, fps: u16, origin: Instant) -> Result<TimerHandle> {
    if fps == 0 {
        return Err(BeatlightError::InvalidInput("frame clock needs a non-zero rate"));
    }
    let period = Duration::from_secs(1) / u32::from(fps);
    let dt_ms = u16::try_from(period.as_millis()).unwrap_or(u16::MAX);
    PeriodicTimer::new(period).start(move || {
        bus.publish_now(TickEvent {
            ts: Timestamp::since(origin),
            fps_target: fps,
            dt_ms,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Timeout;
    use crate::config::QueueConfig;

    #[derive(Debug, Default)]
    struct Recorder {
        selected: Vec<String>,
        beats: Vec<Timestamp>,
        frames: u64,
        brightness: u16,
    }

    impl Animator for Recorder {
        fn select(&mut self, _index: usize, name: &str) {
            self.selected.push(name.to_owned());
        }

        fn beat(&mut self, ts: Timestamp) {
            self.beats.push(ts);
        }

        fn frame(&mut self, _frame: u64, brightness: u16) {
            self.frames += 1;
            self.brightness = brightness;
        }
    }

    fn control() -> AnimationControl<Recorder> {
        AnimationControl::new(&RenderConfig::default(), Recorder::default()).unwrap()
    }

    fn beat(ms: u64) -> BeatEvent {
        BeatEvent {
            ts: Timestamp::from_millis(ms),
            bands: [true, false],
        }
    }

    fn cmd(kind: AnimCmdType, value: u16) -> AnimCmd {
        AnimCmd::new(Timestamp::default(), kind, value)
    }

    #[test]
    fn folds_fnv_hash_to_sixteen_bits() {
        assert_eq!(catalog_id(""), 0x811c ^ 0x9dc5);
        assert_eq!(catalog_id("a"), 0xe40c ^ 0x292c);
    }

    #[test]
    fn beats_within_holdoff_are_suppressed() {
        let mut control = control();
        assert!(control.on_beat(&beat(1_000)));
        assert!(!control.on_beat(&beat(1_150)));
        assert!(control.on_beat(&beat(1_200)));
        assert_eq!(control.suppressed_beats(), 1);
        assert_eq!(
            control.animator().beats,
            vec![Timestamp::from_millis(1_000), Timestamp::from_millis(1_200)]
        );
    }

    #[test]
    fn next_wraps_into_cycling() {
        let mut control = control();
        for _ in 0..3 {
            control.next();
        }
        assert_eq!(control.current_name(), "beat_flash");
        assert!(!control.is_cycling());

        control.next();
        assert_eq!(control.current_index(), 0);
        assert!(control.is_cycling());

        for _ in 0..CYCLE_TICKS {
            control.on_tick(&TickEvent::default());
        }
        assert_eq!(control.current_name(), "larson_scanner");
        assert_eq!(control.frame_count(), CYCLE_TICKS);
    }

    #[test]
    fn prev_wraps_to_last_and_stops_cycling() {
        let mut control = control();
        control.apply(&cmd(AnimCmdType::Prev, 0));
        assert_eq!(control.current_name(), "beat_flash");
        assert!(!control.is_cycling());
    }

    #[test]
    fn applies_index_name_and_brightness_commands() {
        let mut control = control();
        assert!(control.apply(&cmd(AnimCmdType::SetIndex, 2)));
        assert_eq!(control.current_name(), "solar_corona");
        assert!(!control.apply(&cmd(AnimCmdType::SetIndex, 9)));
        assert_eq!(control.current_index(), 2);

        assert!(control.apply(&cmd(AnimCmdType::SetName, catalog_id("larson_scanner"))));
        assert_eq!(control.current_name(), "larson_scanner");

        control.apply(&cmd(AnimCmdType::Brightness, 250));
        control.on_tick(&TickEvent::default());
        assert_eq!(control.brightness(), 100);
        assert_eq!(control.animator().brightness, 100);
        assert_eq!(
            control.animator().selected,
            vec!["beat_pulse", "solar_corona", "larson_scanner"]
        );
    }

    #[test]
    fn handle_routes_bus_traffic() {
        let bus = Arc::new(EventBus::new(QueueConfig::default()).unwrap());
        let handle = AnimationHandle::new(control());
        let mut dispatcher = Dispatcher::new("render", bus.clone());
        handle.attach(&mut dispatcher);

        bus.publish_now(beat(10));
        bus.publish_now(TickEvent::default());
        assert!(bus.publish(cmd(AnimCmdType::Next, 0), Timeout::NoWait));
        assert_eq!(dispatcher.drain(), 3);

        let (beats, frames, name) = handle.with(|control| {
            (
                control.accepted_beats(),
                control.frame_count(),
                control.current_name().to_owned(),
            )
        });
        assert_eq!((beats, frames), (1, 1));
        assert_eq!(name, "larson_scanner");
    }

    #[test]
    fn ticks_are_skipped_while_control_is_held() {
        let bus = Arc::new(EventBus::new(QueueConfig::default()).unwrap());
        let handle = AnimationHandle::new(control());
        let mut dispatcher = Dispatcher::new("render", bus.clone());
        handle.attach(&mut dispatcher);

        bus.publish_now(TickEvent::default());
        let held = handle.shared.lock();
        assert!(handle.try_with(|control| control.frame_count()).is_none());
        assert_eq!(dispatcher.drain(), 1);
        drop(held);

        assert_eq!(handle.with(|control| control.frame_count()), 0);
        bus.publish_now(TickEvent::default());
        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(handle.try_with(|control| control.frame_count()), Some(1));
    }

    #[test]
    fn frame_clock_publishes_ticks() {
        let bus = Arc::new(EventBus::new(QueueConfig::default()).unwrap());
        let clock = spawn_frame_clock(bus.clone(), 200, Instant::now()).unwrap();
        let tick = bus
            .subscribe::<TickEvent>(Timeout::After(Duration::from_secs(2)))
            .unwrap();
        clock.stop();
        assert_eq!(tick.fps_target, 200);
        assert_eq!(tick.dt_ms, 5);
    }

    #[test]
    fn rejects_empty_catalog() {
        let config = RenderConfig {
            animations: Vec::new(),
            ..RenderConfig::default()
        };
        assert!(AnimationControl::new(&config, LoggingAnimator::new()).is_err());
    }
}
