//! Node event loop: radio, timers and operator commands all feed one engine.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use meshroute_core::{Action, Event, NodeAddress, RouteEngine, TimerId};
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::radio::{Radio, Received};

/// Operator command read from stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `route [a.b]`: discover (or probe) a destination; bare `route` uses the configured target.
    Route(Option<NodeAddress>),
    Table,
    Help,
}

pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let cmd = words.next().unwrap_or("");
    let arg = words.next();
    if words.next().is_some() {
        return Err(format!("too many arguments: {}", line.trim()));
    }
    match (cmd, arg) {
        ("route" | "probe", None) => Ok(Command::Route(None)),
        ("route" | "probe", Some(a)) => a
            .parse()
            .map(|a| Command::Route(Some(a)))
            .map_err(|e| format!("{}: {}", a, e)),
        ("table", None) => Ok(Command::Table),
        ("help" | "?", None) => Ok(Command::Help),
        _ => Err(format!("unknown command: {}", line.trim())),
    }
}

pub struct Node {
    engine: RouteEngine,
    radio: Radio,
    target: Option<NodeAddress>,
    jitter: Duration,
    timers: HashMap<TimerId, JoinHandle<()>>,
    fired_tx: mpsc::UnboundedSender<TimerId>,
    fired_rx: mpsc::UnboundedReceiver<TimerId>,
}

impl Node {
    pub fn new(
        engine: RouteEngine,
        radio: Radio,
        target: Option<NodeAddress>,
        jitter: Duration,
    ) -> Self {
        let (fired_tx, fired_rx) = mpsc::unbounded_channel();
        Self {
            engine,
            radio,
            target,
            jitter,
            timers: HashMap::new(),
            fired_tx,
            fired_rx,
        }
    }

    /// Run until `shutdown` completes or the radio fails.
    pub async fn run(mut self, shutdown: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdin_open = true;
        info!(node = %self.engine.address(), "node up");
        loop {
            tokio::select! {
                received = self.radio.recv() => {
                    if let Some(r) = received.context("radio receive failed")? {
                        self.on_received(r).await;
                    }
                }
                Some(timer) = self.fired_rx.recv() => {
                    self.timers.remove(&timer);
                    let actions = self.engine.on_timer_fired(timer);
                    self.perform(actions).await;
                }
                line = lines.next_line(), if stdin_open => {
                    match line {
                        Ok(Some(l)) if l.trim().is_empty() => {}
                        Ok(Some(l)) => self.on_command(&l).await,
                        Ok(None) => stdin_open = false,
                        Err(e) => {
                            warn!(error = %e, "stdin closed");
                            stdin_open = false;
                        }
                    }
                }
                res = &mut shutdown => {
                    res?;
                    break;
                }
            }
        }
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
        info!(node = %self.engine.address(), "node down");
        Ok(())
    }

    async fn on_received(&mut self, received: Received) {
        let (result, was_broadcast) = match &received {
            Received::Broadcast { from, payload } => {
                (self.engine.on_broadcast_received(payload, *from), true)
            }
            Received::Unicast { from, payload } => {
                (self.engine.on_unicast_received(payload, *from), false)
            }
        };
        match result {
            Ok(actions) => self.perform(actions).await,
            Err(e) => debug!(error = %e, "dropping payload"),
        }
        if was_broadcast {
            debug!("routing table of {}:\n{}", self.engine.address(), self.engine.table());
        }
    }

    async fn on_command(&mut self, line: &str) {
        match parse_command(line) {
            Ok(Command::Route(dest)) => {
                let Some(dest) = dest.or(self.target) else {
                    println!("no target: use `route <a.b>` or set `target` in the config");
                    return;
                };
                if dest == self.engine.address() {
                    println!("{} is this node", dest);
                    return;
                }
                let actions = self.engine.discover(dest);
                self.perform(actions).await;
            }
            Ok(Command::Table) => print!("{}", self.engine.table()),
            Ok(Command::Help) => println!("commands: route [a.b] | probe | table | help"),
            Err(e) => println!("{}", e),
        }
    }

    async fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Broadcast(payload) => {
                    let delay = random_delay(self.jitter);
                    self.radio.broadcast_after(&payload, delay);
                }
                Action::Unicast(to, payload) => match self.radio.unicast(to, &payload).await {
                    Ok(true) => {}
                    Ok(false) => warn!(peer = %to, "unicast to unknown neighbor dropped"),
                    Err(e) => warn!(peer = %to, error = %e, "unicast failed"),
                },
                Action::ArmTimer { timer, after } => {
                    let tx = self.fired_tx.clone();
                    let handle = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(timer);
                    });
                    if let Some(old) = self.timers.insert(timer, handle) {
                        old.abort();
                    }
                }
                Action::CancelTimer(timer) => {
                    if let Some(handle) = self.timers.remove(&timer) {
                        handle.abort();
                    }
                }
                Action::Notify(event) => report(&event),
            }
        }
    }
}

fn random_delay(max: Duration) -> Duration {
    let ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=ms))
}

fn report(event: &Event) {
    match event {
        Event::RouteEstablished {
            dest,
            next_hop,
            distance,
        } => println!("route to {} via {} ({} hops)", dest, next_hop, distance),
        Event::PathTraced { origin, path } => {
            let hops: Vec<String> = path.iter().map(|a| a.to_string()).collect();
            println!("probe from {}: {}", origin, hops.join(" -> "));
        }
        Event::NoRoute { dest } => println!("no route to {}", dest),
        Event::RouteLost { dest } => println!("route to {} lost", dest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("route"), Ok(Command::Route(None)));
        assert_eq!(
            parse_command("  route 8.0 "),
            Ok(Command::Route(Some(NodeAddress::new(8, 0))))
        );
        assert_eq!(parse_command("probe"), Ok(Command::Route(None)));
        assert_eq!(parse_command("table"), Ok(Command::Table));
        assert_eq!(parse_command("?"), Ok(Command::Help));
    }

    #[test]
    fn bad_commands_rejected() {
        assert!(parse_command("route eight").is_err());
        assert!(parse_command("route 8.0 9.0").is_err());
        assert!(parse_command("table 1").is_err());
        assert!(parse_command("dance").is_err());
    }

    #[test]
    fn delay_stays_within_jitter() {
        assert_eq!(random_delay(Duration::ZERO), Duration::ZERO);
        for _ in 0..50 {
            assert!(random_delay(Duration::from_millis(20)) <= Duration::from_millis(20));
        }
    }
}
