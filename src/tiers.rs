//! Hierarchical progress tracking for tiered worker agents.
//!
//! Large builds fan out into tiers of parallel worker agents, each owning a
//! set of files. The tracker mirrors that hierarchy client-side and absorbs
//! the channel's delivery quirks: duplicated events are no-ops, completion
//! events sweep whatever fine-grained progress was dropped, and events for
//! agents nobody announced create the agent on demand instead of losing
//! progress.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Per-file build state. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    Building,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Done,
}

/// One file owned by a worker agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub status: FileStatus,
}

/// One worker agent and the files it owns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProgress {
    pub agent_id: String,
    pub tier: u32,
    pub status: AgentStatus,
    pub files: Vec<FileEntry>,
    /// Whether an explicit start event introduced this agent, as opposed to
    /// a placeholder created from an out-of-order file event.
    #[serde(skip)]
    announced: bool,
}

impl AgentProgress {
    pub fn files_done(&self) -> usize {
        self.files
            .iter()
            .filter(|f| f.status == FileStatus::Done)
            .count()
    }

    fn advance_file(&mut self, path: &str, to: FileStatus) -> bool {
        match self.files.iter_mut().find(|f| f.path == path) {
            Some(file) => {
                if file.status < to {
                    file.status = to;
                    true
                } else {
                    false
                }
            }
            None => {
                // Manifest for this file was dropped or never sent.
                self.files.push(FileEntry {
                    path: path.to_string(),
                    status: to,
                });
                true
            }
        }
    }

    fn sweep_files_done(&mut self) -> usize {
        let mut swept = 0;
        for file in &mut self.files {
            if file.status != FileStatus::Done {
                file.status = FileStatus::Done;
                swept += 1;
            }
        }
        swept
    }
}

/// Client-side mirror of the build's tier/agent/file hierarchy.
///
/// Empty until the backend announces a tiered plan or a tier-scoped event
/// arrives; flat single-stream builds never populate it.
#[derive(Debug, Default)]
pub struct TierTracker {
    agents: Vec<AgentProgress>,
    planned: BTreeMap<u32, Vec<String>>,
    started_tiers: BTreeSet<u32>,
    completed_tiers: BTreeSet<u32>,
}

impl TierTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a freshly computed tier plan, replacing any prior structure.
    ///
    /// A re-emission after a retry means the backend replanned, so existing
    /// agent progress is discarded along with the old plan.
    pub fn reset(&mut self, plan: impl IntoIterator<Item = (u32, Vec<String>)>) {
        self.agents.clear();
        self.started_tiers.clear();
        self.completed_tiers.clear();
        self.planned = plan.into_iter().collect();
    }

    /// Whether any tiered structure has been observed.
    pub fn has_structure(&self) -> bool {
        !self.agents.is_empty() || !self.planned.is_empty()
    }

    /// Marks a tier as started. Returns false when it already was.
    pub fn tier_started(&mut self, tier: u32) -> bool {
        self.started_tiers.insert(tier)
    }

    /// Introduces a worker agent with its owned files.
    ///
    /// First announcement wins: a duplicate start for an announced agent is
    /// ignored. A start for a placeholder created by an earlier out-of-order
    /// file event adopts the placeholder, fixing its tier and merging files.
    pub fn agent_started(&mut self, agent_id: &str, tier: u32, files: &[String]) -> bool {
        if let Some(agent) = self.agents.iter_mut().find(|a| a.agent_id == agent_id) {
            if agent.announced {
                return false;
            }
            agent.tier = tier;
            agent.announced = true;
            for path in files {
                if !agent.files.iter().any(|f| &f.path == path) {
                    agent.files.push(FileEntry {
                        path: path.clone(),
                        status: FileStatus::Pending,
                    });
                }
            }
            return true;
        }

        self.agents.push(AgentProgress {
            agent_id: agent_id.to_string(),
            tier,
            status: AgentStatus::Running,
            files: files
                .iter()
                .map(|path| FileEntry {
                    path: path.clone(),
                    status: FileStatus::Pending,
                })
                .collect(),
            announced: true,
        });
        true
    }

    /// Marks a file as being generated. Returns false when nothing changed.
    pub fn file_building(&mut self, agent_id: Option<&str>, path: &str) -> bool {
        self.advance(agent_id, path, FileStatus::Building)
    }

    /// Marks a file done. Duplicated completions are no-ops.
    pub fn file_done(&mut self, agent_id: Option<&str>, path: &str) -> bool {
        self.advance(agent_id, path, FileStatus::Done)
    }

    fn advance(&mut self, agent_id: Option<&str>, path: &str, to: FileStatus) -> bool {
        match agent_id {
            Some(id) => {
                let agent = self.ensure_agent(id);
                agent.advance_file(path, to)
            }
            None => match self
                .agents
                .iter_mut()
                .find(|a| a.files.iter().any(|f| f.path == path))
            {
                Some(agent) => agent.advance_file(path, to),
                None => false,
            },
        }
    }

    /// Marks an agent done and sweeps its remaining files to done, covering
    /// any per-file completions that were dropped. Returns the sweep count.
    pub fn agent_done(&mut self, agent_id: &str) -> usize {
        let agent = self.ensure_agent(agent_id);
        agent.status = AgentStatus::Done;
        agent.sweep_files_done()
    }

    /// Marks every agent in a tier done, sweeping their files. Returns how
    /// many files were newly completed by the sweep.
    pub fn tier_completed(&mut self, tier: u32) -> usize {
        self.started_tiers.insert(tier);
        self.completed_tiers.insert(tier);
        let mut swept = 0;
        for agent in self.agents.iter_mut().filter(|a| a.tier == tier) {
            agent.status = AgentStatus::Done;
            swept += agent.sweep_files_done();
        }
        swept
    }

    /// Finds an agent, creating an unannounced tier-0 placeholder if needed.
    fn ensure_agent(&mut self, agent_id: &str) -> &mut AgentProgress {
        if let Some(idx) = self.agents.iter().position(|a| a.agent_id == agent_id) {
            return &mut self.agents[idx];
        }
        self.agents.push(AgentProgress {
            agent_id: agent_id.to_string(),
            tier: 0,
            status: AgentStatus::Running,
            files: Vec::new(),
            announced: false,
        });
        let idx = self.agents.len() - 1;
        &mut self.agents[idx]
    }

    pub fn agents(&self) -> &[AgentProgress] {
        &self.agents
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentProgress> {
        self.agents.iter().find(|a| a.agent_id == agent_id)
    }

    /// `(done, total)` file counters across a tier's agents.
    pub fn tier_progress(&self, tier: u32) -> (usize, usize) {
        let mut done = 0;
        let mut total = 0;
        for agent in self.agents.iter().filter(|a| a.tier == tier) {
            done += agent.files_done();
            total += agent.files.len();
        }
        (done, total)
    }

    pub fn is_tier_complete(&self, tier: u32) -> bool {
        self.completed_tiers.contains(&tier)
    }
}
