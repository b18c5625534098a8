//! Offline drivers for the throttles: replaying recorded events and
//! simulating synthetic load.
//!
//! Replayed events carry wall-clock timestamps. They are mapped onto a
//! monotonic timeline that starts at the first event, so a log recorded
//! over an hour replays in milliseconds with the same decisions.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{debug, info};

use crate::config::{RotationStrategy, StarguardConfig};
use crate::error::{Result, StarguardError};
use crate::ratelimit::{Admission, ChannelId, GuildId, MessageId, StarboardId, UserId};
use crate::throttle::{
    retry_message, MessageApi, MessageOp, StarboardCooldown, StarboardCooldownConfig,
    StarboardThrottles, ThrottledMessages,
};

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ReactionAdd {
        guild: GuildId,
    },
    Autostar {
        channel: ChannelId,
    },
    Vote {
        user: UserId,
        starboard: StarboardId,
        #[serde(default)]
        cooldown: StarboardCooldownConfig,
    },
    Command {
        user: UserId,
        command: String,
    },
    Message {
        op: MessageOp,
        guild: GuildId,
        channel: ChannelId,
        #[serde(default)]
        message: Option<MessageId>,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::ReactionAdd { .. } => "reaction_add",
            EventKind::Autostar { .. } => "autostar",
            EventKind::Vote { .. } => "vote",
            EventKind::Command { .. } => "command",
            EventKind::Message { op: MessageOp::Send, .. } => "message_send",
            EventKind::Message { op: MessageOp::Edit, .. } => "message_edit",
            EventKind::Message { op: MessageOp::Delete, .. } => "message_delete",
        }
    }
}

/// The outcome of one replayed event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notice: Option<String>,
}

/// Admitted and rejected counts for one event kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KindSummary {
    pub admitted: u64,
    pub rejected: u64,
}

/// Per-kind totals, ordered by kind name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub kinds: BTreeMap<&'static str, KindSummary>,
}

impl Summary {
    pub fn record(&mut self, kind: &'static str, allowed: bool) {
        let entry = self.kinds.entry(kind).or_default();
        if allowed {
            entry.admitted += 1;
        } else {
            entry.rejected += 1;
        }
    }

    pub fn get(&self, kind: &str) -> KindSummary {
        self.kinds.get(kind).copied().unwrap_or_default()
    }

    pub fn total(&self) -> KindSummary {
        self.kinds.values().fold(KindSummary::default(), |acc, s| KindSummary {
            admitted: acc.admitted + s.admitted,
            rejected: acc.rejected + s.rejected,
        })
    }
}

/// Message API that only logs. Used when replaying.
#[derive(Debug, Default)]
pub struct DryRunApi {
    next_id: AtomicU64,
}

#[async_trait]
impl MessageApi for DryRunApi {
    async fn send(&self, guild: GuildId, channel: ChannelId, content: &str) -> Result<MessageId> {
        let id = MessageId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        debug!(guild = %guild, channel = %channel, message = %id, content, "Dry run send");
        Ok(id)
    }

    async fn edit(
        &self,
        guild: GuildId,
        channel: ChannelId,
        message: MessageId,
        content: &str,
    ) -> Result<()> {
        debug!(guild = %guild, channel = %channel, message = %message, content, "Dry run edit");
        Ok(())
    }

    async fn delete(&self, guild: GuildId, channel: ChannelId, message: MessageId) -> Result<()> {
        debug!(guild = %guild, channel = %channel, message = %message, "Dry run delete");
        Ok(())
    }
}

/// Maps event timestamps onto a monotonic timeline.
#[derive(Debug)]
struct EventClock {
    base: Instant,
    origin: Option<DateTime<Utc>>,
}

impl EventClock {
    fn new(base: Instant) -> Self {
        Self { base, origin: None }
    }

    /// Events stamped before the first one map to the start of the timeline.
    fn instant(&mut self, at: DateTime<Utc>) -> Instant {
        let origin = *self.origin.get_or_insert(at);
        let offset = (at - origin).to_std().unwrap_or(Duration::ZERO);
        self.base + offset
    }
}

/// Build throttles for a driver that runs on event time.
///
/// Scheduled rotation follows the wall clock and would never see the event
/// timeline, so every registry rotates lazily here.
pub fn offline_throttles(config: &StarguardConfig) -> Result<StarboardThrottles> {
    let mut config = config.clone();
    config.rotation.commands = RotationStrategy::Lazy;
    StarboardThrottles::new(&config)
}

/// Runs events through a set of throttles.
///
/// The throttles should come from [`offline_throttles`].
pub struct Replayer {
    throttles: Arc<StarboardThrottles>,
    messages: ThrottledMessages<DryRunApi>,
    clock: EventClock,
    summary: Summary,
}

impl Replayer {
    pub fn new(throttles: Arc<StarboardThrottles>) -> Self {
        Self {
            messages: ThrottledMessages::new(DryRunApi::default(), Arc::clone(&throttles)),
            throttles,
            clock: EventClock::new(Instant::now()),
            summary: Summary::default(),
        }
    }

    /// Apply one event and record its outcome.
    pub async fn apply(&mut self, event: Event) -> Result<Decision> {
        let now = self.clock.instant(event.at);
        let kind = event.kind.name();

        let admission = match event.kind {
            EventKind::ReactionAdd { guild } => {
                admitted(self.throttles.allow_reaction(guild, now))
            }
            EventKind::Autostar { channel } => {
                admitted(self.throttles.allow_autostar(channel, now))
            }
            EventKind::Vote {
                user,
                starboard,
                cooldown,
            } => {
                let cooldown = StarboardCooldown::try_from(cooldown)?;
                admitted(self.throttles.allow_vote(user, starboard, &cooldown, now))
            }
            EventKind::Command { user, command } => {
                self.throttles.command_cooldown(user, &command, now)
            }
            EventKind::Message {
                op,
                guild,
                channel,
                message,
            } => {
                let message = message.unwrap_or(MessageId(0));
                let sent = match op {
                    MessageOp::Send => self
                        .messages
                        .send_at(now, guild, channel, "")
                        .await?
                        .is_some(),
                    MessageOp::Edit => self
                        .messages
                        .edit_at(now, guild, channel, message, "")
                        .await?
                        .is_some(),
                    MessageOp::Delete => self
                        .messages
                        .delete_at(now, guild, channel, message)
                        .await?
                        .is_some(),
                };
                admitted(sent)
            }
        };

        self.summary.record(kind, admission.is_allowed());

        let (retry_after_ms, notice) = match admission {
            Admission::Limited { retry_after } if kind == "command" => (
                Some(retry_after.as_millis() as u64),
                Some(retry_message(retry_after)),
            ),
            _ => (None, None),
        };

        Ok(Decision {
            at: event.at,
            kind,
            allowed: admission.is_allowed(),
            retry_after_ms,
            notice,
        })
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }
}

fn admitted(allowed: bool) -> Admission {
    if allowed {
        Admission::Allowed
    } else {
        Admission::Limited {
            retry_after: Duration::ZERO,
        }
    }
}

/// Replay JSON-lines events from `reader`, writing one JSON decision per
/// line to `writer`. Blank lines are skipped.
pub async fn replay<R, W>(reader: R, mut writer: W, replayer: &mut Replayer) -> Result<Summary>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = LinesStream::new(reader.lines());
    let mut line_no = 0;

    while let Some(line) = lines.next().await {
        let line = line?;
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }

        let event: Event = serde_json::from_str(&line)
            .map_err(|source| StarguardError::InvalidEvent { line: line_no, source })?;
        let decision = replayer.apply(event).await?;

        let mut out = serde_json::to_vec(&decision)?;
        out.push(b'\n');
        writer.write_all(&out).await?;
    }
    writer.flush().await?;

    let summary = replayer.summary().clone();
    let total = summary.total();
    info!(
        events = total.admitted + total.rejected,
        admitted = total.admitted,
        rejected = total.rejected,
        "Replay finished"
    );
    Ok(summary)
}

/// Parameters for a synthetic workload.
#[derive(Debug, Clone)]
pub struct Simulation {
    pub guilds: u64,
    pub events: u64,
    pub seed: u64,
    /// Events per second across all guilds
    pub rate: f64,
}

/// Drive a seeded random workload through `throttles`.
///
/// Half of all events target guild 0 to model one hot guild among many
/// quiet ones. The mix is 70% reactions, 10% each autostar, votes and
/// commands.
///
/// Setting `stop` ends the run early with the totals so far.
pub fn simulate(
    throttles: &StarboardThrottles,
    simulation: &Simulation,
    stop: &AtomicBool,
) -> Result<Summary> {
    let step = Duration::try_from_secs_f64(1.0 / simulation.rate)
        .ok()
        .filter(|_| simulation.guilds > 0 && simulation.rate > 0.0)
        .ok_or_else(|| {
            StarguardError::Config(
                "simulation needs at least one guild and a positive rate".to_string(),
            )
        })?;

    let mut rng = StdRng::seed_from_u64(simulation.seed);
    let mut summary = Summary::default();
    let cooldown = StarboardCooldown::try_from(StarboardCooldownConfig {
        enabled: true,
        ..Default::default()
    })?;
    let start = Instant::now();

    for i in 0..simulation.events {
        if stop.load(Ordering::Relaxed) {
            info!(processed = i, "Simulation interrupted");
            break;
        }

        let now = start + step.mul_f64(i as f64);
        let guild = if rng.gen_bool(0.5) {
            0
        } else {
            rng.gen_range(0..simulation.guilds)
        };
        let user = UserId(rng.gen_range(0..1_000));

        let roll: u32 = rng.gen_range(0..10);
        let (kind, allowed) = match roll {
            0..=6 => ("reaction_add", throttles.allow_reaction(GuildId(guild), now)),
            7 => ("autostar", throttles.allow_autostar(ChannelId(guild * 10), now)),
            8 => (
                "vote",
                throttles.allow_vote(user, StarboardId(guild), &cooldown, now),
            ),
            _ => (
                "command",
                throttles.command_cooldown(user, "leaderboard", now).is_allowed(),
            ),
        };
        summary.record(kind, allowed);
    }

    let total = summary.total();
    info!(
        events = total.admitted + total.rejected,
        admitted = total.admitted,
        rejected = total.rejected,
        "Simulation finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn throttles() -> Arc<StarboardThrottles> {
        Arc::new(offline_throttles(&StarguardConfig::default()).unwrap())
    }

    fn keep_running() -> AtomicBool {
        AtomicBool::new(false)
    }

    #[test]
    fn test_event_parsing() {
        let line = concat!(
            r#"{"at":"2024-05-01T12:00:00Z","kind":"vote","user":1,"starboard":2,"#,
            r#""cooldown":{"enabled":true,"capacity":1,"period_secs":30}}"#
        );
        let event: Event = serde_json::from_str(line).unwrap();
        assert_eq!(
            event.kind,
            EventKind::Vote {
                user: UserId(1),
                starboard: StarboardId(2),
                cooldown: StarboardCooldownConfig {
                    enabled: true,
                    capacity: 1,
                    period_secs: 30.0,
                },
            }
        );

        let line = concat!(
            r#"{"at":"2024-05-01T12:00:00Z","kind":"message","#,
            r#""op":"edit","guild":1,"channel":2,"message":3}"#
        );
        let event: Event = serde_json::from_str(line).unwrap();
        assert_eq!(event.kind.name(), "message_edit");
    }

    #[test]
    fn test_event_clock_follows_timestamps() {
        let base = Instant::now();
        let mut clock = EventClock::new(base);
        let t0: DateTime<Utc> = "2024-05-01T12:00:00Z".parse().unwrap();

        assert_eq!(clock.instant(t0), base);
        assert_eq!(
            clock.instant(t0 + chrono::Duration::milliseconds(4500)),
            base + Duration::from_millis(4500)
        );
        assert_eq!(clock.instant(t0 - chrono::Duration::seconds(3)), base);
    }

    #[tokio::test]
    async fn test_replay_writes_decisions() {
        let input = [
            r#"{"at":"2024-05-01T12:00:00Z","kind":"command","user":1,"command":"refresh-roles"}"#,
            "",
            r#"{"at":"2024-05-01T12:00:30Z","kind":"command","user":1,"command":"refresh-roles"}"#,
            r#"{"at":"2024-05-01T12:00:30Z","kind":"reaction_add","guild":5}"#,
        ]
        .join("\n");

        let mut replayer = Replayer::new(throttles());
        let mut output = Vec::new();
        let summary = replay(input.as_bytes(), &mut output, &mut replayer).await.unwrap();

        assert_eq!(summary.get("command"), KindSummary { admitted: 1, rejected: 1 });
        assert_eq!(summary.get("reaction_add"), KindSummary { admitted: 1, rejected: 0 });

        let lines: Vec<serde_json::Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["allowed"], true);
        assert_eq!(lines[1]["allowed"], false);
        assert_eq!(lines[1]["retry_after_ms"], 570_000);
        assert_eq!(lines[1]["notice"], "You're on cooldown, try again in 570 seconds.");
        assert!(lines[2].get("retry_after_ms").is_none());
    }

    #[tokio::test]
    async fn test_replay_throttles_message_calls() {
        let input: String = (0..6)
            .map(|i| {
                format!(
                    concat!(
                        r#"{{"at":"2024-05-01T12:00:0{}Z","kind":"message","#,
                        r#""op":"send","guild":1,"channel":2}}"#
                    ),
                    i / 3
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        let mut replayer = Replayer::new(throttles());
        let summary = replay(input.as_bytes(), tokio::io::sink(), &mut replayer).await.unwrap();
        assert_eq!(summary.get("message_send"), KindSummary { admitted: 5, rejected: 1 });
    }

    #[tokio::test]
    async fn test_replay_reports_bad_line() {
        let input = concat!(
            r#"{"at":"2024-05-01T12:00:00Z","kind":"reaction_add","guild":1}"#,
            "\nnot json\n"
        );
        let mut replayer = Replayer::new(throttles());

        let err = replay(input.as_bytes(), tokio::io::sink(), &mut replayer).await.unwrap_err();
        assert!(matches!(err, StarguardError::InvalidEvent { line: 2, .. }));
    }

    #[test]
    fn test_simulation_is_deterministic() {
        let simulation = Simulation {
            guilds: 20,
            events: 2_000,
            seed: 7,
            rate: 200.0,
        };

        let first = simulate(&throttles(), &simulation, &keep_running()).unwrap();
        let second = simulate(&throttles(), &simulation, &keep_running()).unwrap();
        assert_eq!(first, second);

        let total = first.total();
        assert_eq!(total.admitted + total.rejected, 2_000);
        // The hot guild receives far more reactions than its limit allows.
        assert!(first.get("reaction_add").rejected > 0);
    }

    #[test]
    fn test_simulation_rejects_bad_parameters() {
        let simulation = Simulation {
            guilds: 0,
            events: 10,
            seed: 1,
            rate: 10.0,
        };
        assert!(simulate(&throttles(), &simulation, &keep_running()).is_err());

        let simulation = Simulation {
            guilds: 5,
            rate: 0.0,
            ..simulation
        };
        assert!(simulate(&throttles(), &simulation, &keep_running()).is_err());
    }

    #[test]
    fn test_simulation_stops_when_flagged() {
        let simulation = Simulation {
            guilds: 10,
            events: u64::MAX,
            seed: 3,
            rate: 1_000.0,
        };

        let summary = simulate(&throttles(), &simulation, &AtomicBool::new(true)).unwrap();
        assert_eq!(summary.total(), KindSummary::default());
    }

    #[test]
    fn test_offline_throttles_rotate_commands_lazily() {
        let throttles = throttles();
        assert!(throttles.start_scheduled_rotation().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_command_keys_are_evicted_on_event_time() {
        let throttles = throttles();
        let mut replayer = Replayer::new(Arc::clone(&throttles));
        let t0: DateTime<Utc> = "2024-05-01T00:00:00Z".parse().unwrap();

        for hour in 0..500u64 {
            let at = t0 + chrono::Duration::hours(hour as i64);
            let command = EventKind::Command {
                user: UserId(hour),
                command: "help".to_string(),
            };
            let reaction = EventKind::ReactionAdd {
                guild: GuildId(hour),
            };
            replayer.apply(Event { at, kind: command }).await.unwrap();
            replayer.apply(Event { at, kind: reaction }).await.unwrap();
        }

        // Each key goes idle for an hour, well past every rotation period.
        for stats in throttles.stats() {
            assert!(stats.active + stats.retiring <= 1, "{stats:?}");
        }
        let commands = throttles.stats().into_iter().find(|s| s.name == "commands").unwrap();
        assert_eq!(commands.active, 1);
    }
}
