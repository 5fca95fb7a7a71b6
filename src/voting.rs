//! Voting ensembles
//!
//! The same task goes to several voters at once. Successful outputs are
//! grouped, the largest group wins, and ties are settled by an explicit rule
//! so identical inputs always pick the same winner.

use std::collections::HashMap;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::agent::AgentHandle;
use crate::context::ReliabilityContext;
use crate::error::AgentFailure;
use crate::fallback::{FallbackHandler, FallbackStrategy};
use crate::orchestrator::{Pattern, WorkflowResult, WorkflowStatus};
use crate::session::{StepOutcome, StepRecord, WorkflowSession};
use crate::task::{AgentCaller, AgentResult, Task};
use crate::validate::extract_json;

/// How outputs are compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Grouping {
    /// Canonical JSON equality
    Exact,
    /// Text compared case-insensitively with whitespace collapsed
    Normalized,
    /// Only the value at a JSON pointer counts
    Field(String),
}

/// How a plurality tie is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Group containing the lowest candidate index
    FirstSeen,
    /// Lexicographically smallest group key
    LowestKey,
}

/// Votes for one group of equivalent outputs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tally {
    pub key: String,
    pub votes: usize,
    /// Candidate indices in this group, ascending
    pub members: Vec<usize>,
    /// Output of the first member
    pub representative: Value,
}

impl Tally {
    fn first_seen(&self) -> usize {
        self.members.first().copied().unwrap_or(usize::MAX)
    }
}

/// Outcome of a vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub grouping: Grouping,
    pub tie_break: TieBreak,
    /// Groups in first-seen order
    pub tallies: Vec<Tally>,
    /// Key of the winning group
    pub winner: Option<String>,
    pub output: Option<Value>,
    /// Whether the tie-break rule decided the winner
    pub tied: bool,
    pub votes_cast: usize,
    /// Candidates with no value under the grouping
    pub abstentions: usize,
}

/// Group `candidates` and pick the winner
pub fn tally(candidates: &[Value], grouping: &Grouping, tie_break: TieBreak) -> Verdict {
    let mut tallies: Vec<Tally> = Vec::new();
    let mut by_key: HashMap<String, usize> = HashMap::new();
    let mut abstentions = 0;

    for (index, candidate) in candidates.iter().enumerate() {
        let Some(key) = group_key(candidate, grouping) else {
            abstentions += 1;
            continue;
        };
        match by_key.get(&key) {
            Some(&slot) => {
                tallies[slot].votes += 1;
                tallies[slot].members.push(index);
            }
            None => {
                by_key.insert(key.clone(), tallies.len());
                tallies.push(Tally {
                    key,
                    votes: 1,
                    members: vec![index],
                    representative: candidate.clone(),
                });
            }
        }
    }

    let top = tallies.iter().map(|t| t.votes).max().unwrap_or(0);
    let leaders: Vec<&Tally> = tallies.iter().filter(|t| t.votes == top).collect();
    let tied = leaders.len() > 1;
    let winner = match tie_break {
        TieBreak::FirstSeen => leaders.iter().min_by_key(|t| t.first_seen()),
        TieBreak::LowestKey => leaders.iter().min_by(|a, b| a.key.cmp(&b.key)),
    };

    Verdict {
        grouping: grouping.clone(),
        tie_break,
        winner: winner.map(|t| t.key.clone()),
        output: winner.map(|t| t.representative.clone()),
        tied,
        votes_cast: candidates.len() - abstentions,
        abstentions,
        tallies,
    }
}

fn group_key(candidate: &Value, grouping: &Grouping) -> Option<String> {
    match grouping {
        Grouping::Exact => Some(canonical(candidate)),
        Grouping::Normalized => Some(match candidate {
            Value::String(text) => normalize(text),
            other => canonical(other),
        }),
        Grouping::Field(pointer) => {
            let document = match candidate {
                Value::String(text) => extract_json(text)?,
                other => other.clone(),
            };
            let field = document.pointer(pointer)?;
            Some(match field {
                Value::String(text) => normalize(text),
                other => canonical(other),
            })
        }
    }
}

fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim_end_matches(['.', '!'])
        .to_lowercase()
}

/// JSON text with object keys sorted at every level
fn canonical(value: &Value) -> String {
    fn sorted(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                let mut out = Map::new();
                for key in keys {
                    out.insert(key.clone(), sorted(&map[key]));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Checkpointed once a verdict is reached
#[derive(Debug, Serialize, Deserialize)]
struct BallotState {
    verdict: Verdict,
    steps: Vec<StepRecord>,
}

pub struct VotingEnsemble {
    ctx: Arc<ReliabilityContext>,
    fallback: FallbackHandler,
    voters: Vec<Arc<dyn AgentCaller>>,
    votes: usize,
    grouping: Grouping,
    tie_break: TieBreak,
}

impl VotingEnsemble {
    /// Three votes from the workflow's caller, exact grouping, first-seen ties
    pub fn new(ctx: Arc<ReliabilityContext>) -> Self {
        let fallback = FallbackHandler::new(Arc::clone(ctx.audit()));
        Self {
            ctx,
            fallback,
            voters: Vec::new(),
            votes: 3,
            grouping: Grouping::Exact,
            tie_break: TieBreak::FirstSeen,
        }
    }

    /// Add a dedicated voter; once any is set the workflow caller is not used
    pub fn voter(mut self, caller: Arc<dyn AgentCaller>) -> Self {
        self.voters.push(caller);
        self
    }

    /// Number of calls to the workflow caller when no voters are set
    pub fn votes(mut self, votes: usize) -> Self {
        self.votes = votes.max(1);
        self
    }

    pub fn grouping(mut self, grouping: Grouping) -> Self {
        self.grouping = grouping;
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackHandler) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn FallbackStrategy>) -> Self {
        self.fallback = self.fallback.with_strategy(strategy);
        self
    }

    /// Put the first task to a vote
    #[instrument(skip(self, tasks, caller), fields(workflow_id = %workflow_id))]
    pub async fn run(
        &self,
        workflow_id: &str,
        tasks: Vec<Task>,
        caller: Arc<dyn AgentCaller>,
    ) -> WorkflowResult {
        let voters: Vec<Arc<dyn AgentCaller>> = if self.voters.is_empty() {
            vec![caller; self.votes]
        } else {
            self.voters.clone()
        };
        let mut session = WorkflowSession::start(&self.ctx, workflow_id, Pattern::Voting, voters.len());

        let Some(task) = tasks.into_iter().next() else {
            session.record(StepRecord::new(
                "vote",
                None,
                StepOutcome {
                    result: Err(AgentFailure::permanent("no task to vote on")),
                    fallback: None,
                    escalated: false,
                },
            ));
            return session.finish(WorkflowStatus::Failed, None, None);
        };

        if let Some((_, ballot)) = session.resume::<BallotState>().await {
            info!(winner = ?ballot.verdict.winner, "Verdict already recorded");
            session.restore(ballot.steps);
            let output = ballot.verdict.output.clone();
            return session.finish(WorkflowStatus::Succeeded, output, Some(ballot.verdict));
        }

        let results = self.collect_votes(workflow_id, &task, &voters).await;

        let mut candidates = Vec::new();
        for (index, result) in results.into_iter().enumerate() {
            if let Ok(value) = &result {
                candidates.push(value.clone());
            }
            session.record(StepRecord::new(
                format!("vote:{}", index),
                Some(task.id.clone()),
                StepOutcome {
                    result,
                    fallback: None,
                    escalated: false,
                },
            ));
        }

        let verdict = tally(&candidates, &self.grouping, self.tie_break);
        let quorum = self.ctx.config().quorum.unwrap_or(1);
        debug!(
            votes_cast = verdict.votes_cast,
            quorum,
            tied = verdict.tied,
            "Votes tallied"
        );

        if verdict.votes_cast >= quorum && verdict.winner.is_some() {
            info!(winner = ?verdict.winner, votes_cast = verdict.votes_cast, "Vote decided");
            let ballot = BallotState {
                verdict,
                steps: session.steps().to_vec(),
            };
            session.checkpoint(ballot.steps.len(), "vote", &ballot).await;
            let output = ballot.verdict.output.clone();
            return session.finish(WorkflowStatus::Succeeded, output, Some(ballot.verdict));
        }

        let cause = AgentFailure::permanent(format!(
            "{} valid votes, quorum is {}",
            verdict.votes_cast, quorum
        ));
        warn!(votes_cast = verdict.votes_cast, quorum, "Vote missed quorum");
        match self.fallback.execute(workflow_id, "vote", &task, cause).await {
            Ok(success) => {
                let output = success.value.clone();
                session.record(StepRecord::new(
                    "vote",
                    Some(task.id.clone()),
                    StepOutcome {
                        result: Ok(success.value),
                        fallback: Some(success.strategy),
                        escalated: success.escalated,
                    },
                ));
                session.finish(WorkflowStatus::Succeeded, Some(output), Some(verdict))
            }
            Err(failure) => {
                session.record(StepRecord::new(
                    "vote",
                    Some(task.id.clone()),
                    StepOutcome {
                        result: Err(failure),
                        fallback: None,
                        escalated: false,
                    },
                ));
                session.finish(WorkflowStatus::Failed, None, Some(verdict))
            }
        }
    }

    /// One result per voter, in voter order
    async fn collect_votes(
        &self,
        workflow_id: &str,
        task: &Task,
        voters: &[Arc<dyn AgentCaller>],
    ) -> Vec<AgentResult> {
        let config = self.ctx.config();
        let agents: Vec<AgentHandle> = voters
            .iter()
            .map(|voter| AgentHandle::new(Arc::clone(voter), Arc::clone(&self.ctx)))
            .collect();
        let mut results: Vec<Option<AgentResult>> = vec![None; agents.len()];

        let deadline = config.workflow_timeout().map(|t| Instant::now() + t);
        {
            let mut ballots = stream::iter(agents.iter().enumerate().map(move |(index, agent)| async move {
                let step = format!("vote:{}", index);
                (index, agent.call(workflow_id, &step, task).await)
            }))
            .buffer_unordered(config.concurrency_limit);

            loop {
                let next = match deadline {
                    Some(deadline) => match tokio::time::timeout_at(deadline, ballots.next()).await {
                        Ok(next) => next,
                        Err(_) => {
                            warn!(workflow_id, "Workflow deadline elapsed while voting");
                            break;
                        }
                    },
                    None => ballots.next().await,
                };
                let Some((index, result)) = next else { break };
                results[index] = Some(result);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(AgentFailure::timeout("workflow deadline elapsed"))))
            .collect()
    }
}
