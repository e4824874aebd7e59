//! Two-deck crossfader.  A new source always starts on the idle deck; the
//! outgoing deck is stopped only once the incoming one is confirmed playing.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use station_core::config::PlayerConfig;

use crate::channel::{wait_for_playback, ChannelError, ChannelLauncher, ChannelState, PlaybackChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FadeMode {
    /// Incoming starts silent and ramps up while the outgoing ramps down.
    Crossfade,
    /// Incoming starts at the duck volume and replaces the outgoing at once.
    Ducked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Deck {
    A,
    B,
}

impl Deck {
    fn label(self) -> &'static str {
        match self {
            Deck::A => "deck-a",
            Deck::B => "deck-b",
        }
    }

    fn other(self) -> Self {
        match self {
            Deck::A => Deck::B,
            Deck::B => Deck::A,
        }
    }
}

/// Step `channel` from `from` to `to` percent in `steps` equal increments.
pub async fn fade(channel: &dyn PlaybackChannel, from: u8, to: u8, steps: u32, step: Duration) {
    let steps = steps.max(1) as i32;
    let (from, to) = (from as i32, to as i32);
    for i in 1..=steps {
        let volume = from + (to - from) * i / steps;
        if let Err(e) = channel.set_volume(volume.clamp(0, 100) as u8).await {
            debug!("fade {}: {}", channel.label(), e);
            return;
        }
        if i < steps {
            tokio::time::sleep(step).await;
        }
    }
}

pub struct Crossfader {
    launcher: Arc<dyn ChannelLauncher>,
    steps: u32,
    step: Duration,
    start_timeout: Duration,
    duck_volume: u8,
    active: Option<Box<dyn PlaybackChannel>>,
    idle: Deck,
}

impl Crossfader {
    pub fn new(launcher: Arc<dyn ChannelLauncher>, config: &PlayerConfig) -> Self {
        Self {
            launcher,
            steps: config.crossfade_steps.max(1),
            step: config.crossfade_step(),
            start_timeout: config.playback_start_timeout(),
            duck_volume: config.duck_volume.min(100),
            active: None,
            idle: Deck::A,
        }
    }

    pub fn active(&self) -> Option<&dyn PlaybackChannel> {
        self.active.as_deref()
    }

    pub async fn active_state(&self) -> Option<ChannelState> {
        match &self.active {
            Some(channel) => Some(channel.state().await),
            None => None,
        }
    }

    /// Put `path` on air from `offset_secs`.  On error the previously active
    /// deck is left untouched.
    pub async fn switch(&mut self, path: &Path, offset_secs: f64, mode: FadeMode) -> Result<(), ChannelError> {
        let deck = self.idle;
        let initial = match mode {
            FadeMode::Crossfade => 0,
            FadeMode::Ducked => self.duck_volume,
        };

        let incoming = self
            .launcher
            .start(deck.label(), path, offset_secs, initial)
            .await?;
        if let Err(e) = wait_for_playback(incoming.as_ref(), self.start_timeout).await {
            incoming.stop().await;
            return Err(e);
        }
        info!("{}: on air {:?} from {:.1}s ({:?})", deck.label(), path, offset_secs, mode);

        let outgoing = self.active.take();
        if mode == FadeMode::Crossfade {
            if let Err(e) = self.ramp(incoming.as_ref(), outgoing.as_deref()).await {
                warn!("crossfade: {} stopped taking volume, keeping the old deck", deck.label());
                if let Some(old) = outgoing.as_deref() {
                    if let Err(e) = old.set_volume(100).await {
                        warn!("crossfade: could not restore {}: {}", old.label(), e);
                    }
                }
                incoming.stop().await;
                self.active = outgoing;
                return Err(e);
            }
        }
        if let Some(old) = outgoing {
            old.stop().await;
        }

        self.active = Some(incoming);
        self.idle = deck.other();
        Ok(())
    }

    /// Lockstep ramp.  Incoming is raised before outgoing is lowered at each
    /// step, so the two volumes never sum below 100.  Stops at the first
    /// volume change the incoming deck refuses.
    async fn ramp(
        &self,
        incoming: &dyn PlaybackChannel,
        outgoing: Option<&dyn PlaybackChannel>,
    ) -> Result<(), ChannelError> {
        for i in 1..=self.steps {
            let up = (100 * i / self.steps) as u8;
            incoming.set_volume(up).await?;
            if let Some(old) = outgoing {
                if let Err(e) = old.set_volume(100 - up).await {
                    debug!("crossfade: outgoing {}", e);
                }
            }
            if i < self.steps {
                tokio::time::sleep(self.step).await;
            }
        }
        Ok(())
    }

    pub async fn stop_all(&mut self) {
        if let Some(channel) = self.active.take() {
            channel.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{Event, FakeLauncher};
    use std::collections::HashMap;
    use std::path::PathBuf;

    fn config() -> PlayerConfig {
        PlayerConfig {
            crossfade_secs: 0.04,
            crossfade_steps: 4,
            playback_start_timeout_secs: 0.3,
            ..PlayerConfig::default()
        }
    }

    /// Replays the log and returns the audible total after every event.
    fn audible_levels(events: &[Event], mut live: HashMap<String, u8>) -> Vec<u32> {
        let mut levels = Vec::new();
        for event in events {
            match event {
                Event::Started { label, volume } => {
                    live.insert(label.clone(), *volume);
                }
                Event::Volume { label, volume } => {
                    live.insert(label.clone(), *volume);
                }
                Event::Stopped { label } => {
                    live.remove(label);
                }
                Event::Playing { .. } => {}
            }
            levels.push(live.values().map(|v| *v as u32).sum());
        }
        levels
    }

    fn position(events: &[Event], wanted: &Event) -> usize {
        events.iter().position(|e| e == wanted).unwrap()
    }

    #[tokio::test]
    async fn test_crossfade_never_silent_and_stops_old_last() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut decks = Crossfader::new(launcher.clone(), &config());

        decks.switch(&PathBuf::from("/a.mp3"), 0.0, FadeMode::Crossfade).await.unwrap();
        let first = launcher.events().len();
        decks.switch(&PathBuf::from("/b.mp3"), 12.0, FadeMode::Crossfade).await.unwrap();

        let events = launcher.events()[first..].to_vec();
        let live: HashMap<String, u8> = [("deck-a".to_string(), 100)].into_iter().collect();
        assert!(audible_levels(&events, live).iter().all(|level| *level >= 100));

        let playing = position(&events, &Event::Playing { label: "deck-b".into() });
        let stopped = position(&events, &Event::Stopped { label: "deck-a".into() });
        assert!(playing < stopped);
        assert_eq!(
            events.last(),
            Some(&Event::Stopped { label: "deck-a".into() })
        );
        assert_eq!(decks.active().unwrap().label(), "deck-b");
    }

    #[tokio::test]
    async fn test_failed_start_keeps_old_deck() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.dead_paths.lock().unwrap().push(PathBuf::from("/broken.mp3"));
        let mut decks = Crossfader::new(launcher.clone(), &config());

        decks.switch(&PathBuf::from("/a.mp3"), 0.0, FadeMode::Crossfade).await.unwrap();
        let err = decks
            .switch(&PathBuf::from("/broken.mp3"), 0.0, FadeMode::Crossfade)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::PlaybackStartTimeout { .. }));

        let events = launcher.events();
        assert!(events.contains(&Event::Stopped { label: "deck-b".into() }));
        assert!(!events.contains(&Event::Stopped { label: "deck-a".into() }));
        assert_eq!(decks.active().unwrap().label(), "deck-a");
        assert_eq!(decks.active_state().await, Some(ChannelState::Running));
    }

    #[tokio::test]
    async fn test_incoming_refusing_volume_keeps_old_deck_audible() {
        let launcher = Arc::new(FakeLauncher::default());
        launcher.deaf_paths.lock().unwrap().push(PathBuf::from("/deaf.mp3"));
        let mut decks = Crossfader::new(launcher.clone(), &config());

        decks.switch(&PathBuf::from("/a.mp3"), 0.0, FadeMode::Crossfade).await.unwrap();
        let first = launcher.events().len();
        let err = decks
            .switch(&PathBuf::from("/deaf.mp3"), 0.0, FadeMode::Crossfade)
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Ipc { .. }));

        let events = launcher.events()[first..].to_vec();
        assert!(events.contains(&Event::Stopped { label: "deck-b".into() }));
        assert!(!events.contains(&Event::Stopped { label: "deck-a".into() }));
        let live: HashMap<String, u8> = [("deck-a".to_string(), 100)].into_iter().collect();
        assert_eq!(audible_levels(&events, live).last(), Some(&100));
        assert_eq!(decks.active().unwrap().label(), "deck-a");

        // The idle deck is reused for the next attempt.
        decks.switch(&PathBuf::from("/b.mp3"), 0.0, FadeMode::Crossfade).await.unwrap();
        assert_eq!(decks.active().unwrap().label(), "deck-b");
    }

    #[tokio::test]
    async fn test_ducked_switch_is_instant() {
        let launcher = Arc::new(FakeLauncher::default());
        let mut decks = Crossfader::new(launcher.clone(), &config());
        decks.switch(&PathBuf::from("/a.mp3"), 0.0, FadeMode::Crossfade).await.unwrap();
        let first = launcher.events().len();

        decks.switch(&PathBuf::from("/b.mp3"), 0.0, FadeMode::Ducked).await.unwrap();
        let events = launcher.events()[first..].to_vec();
        assert_eq!(events[0], Event::Started { label: "deck-b".into(), volume: 10 });
        assert!(!events.iter().any(|e| matches!(e, Event::Volume { .. })));
        let playing = position(&events, &Event::Playing { label: "deck-b".into() });
        let stopped = position(&events, &Event::Stopped { label: "deck-a".into() });
        assert!(playing < stopped);
    }

    #[tokio::test]
    async fn test_fade_steps() {
        let launcher = Arc::new(FakeLauncher::default());
        let channel = launcher.start("x", Path::new("/x.mp3"), 0.0, 100).await.unwrap();
        fade(channel.as_ref(), 100, 10, 3, Duration::ZERO).await;
        let volumes: Vec<u8> = launcher
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Volume { volume, .. } => Some(volume),
                _ => None,
            })
            .collect();
        assert_eq!(volumes, vec![70, 40, 10]);
    }
}
