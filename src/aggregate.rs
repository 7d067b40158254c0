//! Network wide rounds.
//!
//! Fan-out is the canonical mode: the coordinator learns the membership by
//! traversal and asks every member for its contribution concurrently, so one
//! slow or dead member costs one timeout and nothing more. Relay hands the
//! round to the ring itself and lets it travel hop by hop; a dead hop cuts
//! off everything behind it.

use std::{fmt, str::FromStr};

use futures::future::join_all;
use tracing::{debug, info};

use crate::{
    error::Result,
    identity::NodeIdentity,
    net::PeerClient,
    ring::collect_members,
    work::{ContextFrame, Contribution, RoundId},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AggregationMode {
    #[default]
    FanOut,
    Relay,
}

impl FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fan-out" | "fanout" => Ok(Self::FanOut),
            "relay" => Ok(Self::Relay),
            other => Err(format!("unknown aggregation mode {:?}", other)),
        }
    }
}

impl fmt::Display for AggregationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FanOut => "fan-out",
            Self::Relay => "relay",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemberOutcome {
    Contributed(Vec<Contribution>),
    /// The member had already seen this round.
    AlreadyProcessed,
    Unreachable(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberReport {
    pub address: String,
    pub outcome: MemberOutcome,
}

#[derive(Clone, Debug)]
pub struct RoundReport {
    pub round: RoundId,
    pub mode: AggregationMode,
    pub members: Vec<MemberReport>,
}

/// Separates the outputs of several units inside one member's entry.
pub const UNIT_SEPARATOR: &str = " | ";

impl MemberReport {
    /// This member's slot in the joined result. A member without units has
    /// an empty slot.
    pub fn entry(&self) -> String {
        match &self.outcome {
            MemberOutcome::Contributed(contributions) => contributions
                .iter()
                .map(|c| c.outcome.to_string())
                .collect::<Vec<_>>()
                .join(UNIT_SEPARATOR),
            MemberOutcome::AlreadyProcessed => "<already processed>".into(),
            MemberOutcome::Unreachable(reason) => format!("<error: {}>", reason),
        }
    }
}

impl RoundReport {
    /// Exactly one entry per member, in member order.
    pub fn entries(&self) -> Vec<String> {
        self.members.iter().map(MemberReport::entry).collect()
    }

    pub fn joined(&self) -> String {
        self.entries().join("\n")
    }

    pub fn error_count(&self) -> usize {
        self.members
            .iter()
            .map(|member| match &member.outcome {
                MemberOutcome::Contributed(contributions) => {
                    contributions.iter().filter(|c| c.outcome.is_failure()).count()
                }
                MemberOutcome::AlreadyProcessed => 0,
                MemberOutcome::Unreachable(_) => 1,
            })
            .sum()
    }

    pub fn is_error(&self) -> bool {
        self.error_count() > 0
    }
}

/// Originates rounds against a ring reachable through `client`.
#[derive(Clone)]
pub struct Coordinator {
    client: PeerClient,
    cap: usize,
}

impl Coordinator {
    pub fn new(client: PeerClient, cap: usize) -> Self {
        Self { client, cap }
    }

    /// Starts a fresh round from `origin` entering the ring at `start`.
    pub async fn round(
        &self,
        mode: AggregationMode,
        start: &str,
        origin: NodeIdentity,
        selector: Vec<String>,
    ) -> Result<RoundReport> {
        let frame = ContextFrame::originate(origin);
        match mode {
            AggregationMode::FanOut => self.fan_out(start, frame, selector).await,
            AggregationMode::Relay => self.relay(start, frame, selector).await,
        }
    }

    /// Fails only if the membership cannot be established.
    pub async fn fan_out(&self, start: &str, frame: ContextFrame, selector: Vec<String>) -> Result<RoundReport> {
        let members = collect_members(&self.client, start, self.cap).await?;
        debug!(round = %frame.round, members = members.len(), "fanning out");
        let calls = members.iter().map(|address| {
            let frame = frame.clone();
            let selector = selector.clone();
            async move {
                let outcome = match self.client.contribute(address, frame, selector).await {
                    Ok(Some(contributions)) => MemberOutcome::Contributed(contributions),
                    Ok(None) => MemberOutcome::AlreadyProcessed,
                    Err(e) => MemberOutcome::Unreachable(e.to_string()),
                };
                MemberReport {
                    address: address.clone(),
                    outcome,
                }
            }
        });
        let report = RoundReport {
            round: frame.round,
            mode: AggregationMode::FanOut,
            members: join_all(calls).await,
        };
        info!(round = %report.round, members = report.members.len(), errors = report.error_count(), "round complete");
        Ok(report)
    }

    /// Hands the round to `start`'s neighbor and lets it travel the ring.
    /// Members appear in the order the round reached them.
    pub async fn relay(&self, start: &str, frame: ContextFrame, selector: Vec<String>) -> Result<RoundReport> {
        let round = frame.round;
        let first = self.client.neighbor(start).await?;
        let returned = self.client.run(&first, frame, selector).await?;

        let mut members: Vec<MemberReport> = Vec::new();
        for contribution in returned.map(|f| f.contributions).unwrap_or_default() {
            match members.iter_mut().find(|m| m.address == contribution.address) {
                Some(MemberReport {
                    outcome: MemberOutcome::Contributed(list),
                    ..
                }) => list.push(contribution),
                _ => members.push(MemberReport {
                    address: contribution.address.clone(),
                    outcome: MemberOutcome::Contributed(vec![contribution]),
                }),
            }
        }
        info!(%round, members = members.len(), "relay complete");
        Ok(RoundReport {
            round,
            mode: AggregationMode::Relay,
            members,
        })
    }
}
