//! The build orchestrator: discovers the source graph from the entry points,
//! schedules chains on the worker pool, emits outputs, and rebuilds
//! incrementally in watch mode.
//!
//! Phases run Idle -> Discovering -> Building -> (Idle | Watching).  All
//! graph mutation happens on the orchestrator's thread; workers only see
//! content and chains.

use crate::cache::{ArtifactCache, CacheStats, Transformed};
use crate::canon::{canon_path, dirname, is_normalized_relative, join, relative_url, split_name};
use crate::chain::TransformChain;
use crate::config::{Config, Unmatched};
use crate::error::Error;
use crate::fs::{under, FileSystem, MTime};
use crate::graph::{Artifact, BuildGraph, NodeId, NodeKind};
use crate::hash::ContentHash;
use crate::progress::Progress;
use crate::rules::{output_path, NameTemplate, Rule};
use crate::server::{DevServer, Manifest};
use crate::stage::{Chain, Mode};
use crate::task::{Job, Runner};
use crate::trace;
use crate::watch::ChangeFeed;
use crate::work::{NodeState, Work};
use rustc_hash::FxHashMap;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Discovering,
    Building,
    Watching,
}

#[derive(Debug, Clone)]
pub struct Options {
    pub mode: Mode,
    /// Number of worker threads.
    pub parallelism: usize,
}

/// The outcome of one build round.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Paths of the nodes built, in completion order.
    pub built: Vec<String>,
    pub failures: Vec<Error>,
    /// Paths of nodes not built because a dependency failed.
    pub skipped: Vec<String>,
}

impl BuildReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Directory outputs of `source` are written to, relative to the output
/// root.
fn output_dir<'r>(rule: Option<&'r Rule>, source: &'r str) -> &'r str {
    match rule.and_then(|r| r.outdir.as_deref()) {
        Some(dir) => dir,
        None => dirname(source),
    }
}

/// Replace quoted occurrences of `from` with `to`.
fn replace_quoted(text: &str, from: &str, to: &str) -> String {
    let mut out = text.to_string();
    for q in ['"', '\''] {
        out = out.replace(&format!("{q}{from}{q}"), &format!("{q}{to}{q}"));
    }
    out
}

pub struct Orchestrator<'a> {
    fs: &'a dyn FileSystem,
    config: Config,
    mode: Mode,
    parallelism: usize,
    graph: BuildGraph,
    chain: Arc<TransformChain>,
    progress: &'a mut dyn Progress,
    phase: Phase,
    /// Hash of the content each source node was last built from.
    origins: FxHashMap<NodeId, ContentHash>,
    /// Per consumer: each reference as written, and the node it resolved to.
    references: FxHashMap<NodeId, Vec<(String, NodeId)>>,
    /// Paths that changed after they were built in the current round.
    pending: BTreeSet<String>,
    /// Whether the last discovery succeeded; if not, the next round starts
    /// over from the entries.
    discovered: bool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        fs: &'a dyn FileSystem,
        config: Config,
        options: Options,
        progress: &'a mut dyn Progress,
    ) -> Self {
        let cache = Arc::new(ArtifactCache::new(config.cache_capacity));
        Orchestrator {
            fs,
            config,
            mode: options.mode,
            parallelism: options.parallelism.max(1),
            graph: BuildGraph::new(),
            chain: Arc::new(TransformChain::new(cache)),
            progress,
            phase: Phase::Idle,
            origins: FxHashMap::default(),
            references: FxHashMap::default(),
            pending: BTreeSet::new(),
            discovered: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.chain.cache().stats()
    }

    /// Stage transforms executed so far, i.e. cache misses.
    pub fn stage_executions(&self) -> usize {
        self.chain.executions()
    }

    fn source(&self, path: &str) -> std::path::PathBuf {
        under(&self.config.root, path)
    }

    fn exists(&self, path: &str) -> bool {
        matches!(self.fs.stat(&self.source(path)), Ok(MTime::Stamp(_)))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, Error> {
        self.fs
            .read(&self.source(path))
            .map_err(|err| Error::io(path, err))
    }

    fn rule(&self, id: NodeId) -> Option<&Rule> {
        self.graph.node(id).rule.map(|r| self.config.rules.rule(r))
    }

    fn chain_of(&self, id: NodeId) -> Chain {
        match self.rule(id) {
            Some(rule) => rule.chain(self.mode).clone(),
            None => Chain::empty(),
        }
    }

    /// One-shot build of everything reachable from the entries.  Stops
    /// scheduling at the first failure and returns it once running tasks
    /// have drained.
    pub fn build(&mut self) -> Result<BuildReport, Error> {
        if self.config.clean {
            self.fs
                .remove_dir(&self.config.out)
                .map_err(|err| Error::io(self.config.out.display().to_string(), err))?;
        }
        let result = self.full_build(false, None);
        self.phase = Phase::Idle;
        let mut report = result?;
        if !report.failures.is_empty() {
            return Err(report.failures.remove(0));
        }
        Ok(report)
    }

    fn full_build(
        &mut self,
        keep_going: bool,
        feed: Option<&mut ChangeFeed>,
    ) -> Result<BuildReport, Error> {
        self.discovered = false;
        trace::scope("discover", || self.discover())?;
        self.discovered = true;
        let order = self.graph.topo_order();
        Ok(self.build_nodes(&order, keep_going, feed))
    }

    /// Add a source node for `path`, resolving its rule.
    fn add_source(&mut self, path: &str) -> Result<NodeId, Error> {
        if let Some(id) = self.graph.lookup(path) {
            return Ok(id);
        }
        let rule = match self.config.rules.resolve(path) {
            Ok(m) => Some(m.index),
            Err(err) => match self.config.unmatched {
                Unmatched::Error => return Err(err.into()),
                Unmatched::Copy => None,
            },
        };
        Ok(self.graph.add_node(path, NodeKind::Source, rule, &[])?)
    }

    /// Walk the static closure of the entries and copy targets, dropping
    /// nodes left over from an earlier graph that fall outside it.
    pub fn discover(&mut self) -> Result<(), Error> {
        self.phase = Phase::Discovering;
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for entry in self.config.entries.clone() {
            if !self.exists(&entry) {
                return Err(Error::MissingEntry { path: entry });
            }
            queue.push_back(self.add_source(&entry)?);
        }
        for copy in self.config.copies.clone() {
            if !self.exists(&copy) {
                return Err(Error::MissingEntry { path: copy });
            }
            if self.graph.lookup(&copy).is_none() {
                self.graph.add_node(&copy, NodeKind::Source, None, &[])?;
            }
        }
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            queue.extend(self.scan_node(id)?);
        }
        self.prune();
        Ok(())
    }

    /// Remove source nodes no longer reachable from the entries and copy
    /// targets, e.g. after the last reference to a file was deleted.
    fn prune(&mut self) {
        let mut live = BTreeSet::new();
        let mut stack: Vec<NodeId> = self
            .config
            .entries
            .iter()
            .chain(self.config.copies.iter())
            .filter_map(|path| self.graph.lookup(path))
            .collect();
        while let Some(id) = stack.pop() {
            if !live.insert(id) {
                continue;
            }
            let node = self.graph.node(id);
            stack.extend(node.deps().iter().copied());
            stack.extend(self.graph.side_nodes(id).iter().copied());
            if let NodeKind::Side { producer, .. } = node.kind {
                stack.push(producer);
            }
        }
        let dead: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|id| !live.contains(id) && self.graph.node(*id).kind == NodeKind::Source)
            .collect();
        for id in dead {
            if let Some(old) = self.origins.remove(&id) {
                self.chain.cache().invalidate_origin(old);
            }
            self.references.remove(&id);
            self.graph.remove(id);
        }
    }

    /// Resolve a reference written in `from` to an existing source path.
    /// Tries the path as written, then with the importer's extension, then
    /// as an underscore partial.
    fn resolve_reference(&self, from: &str, reference: &str) -> Option<String> {
        let base = reference
            .split(|c| c == '?' || c == '#')
            .next()
            .unwrap_or("");
        if base.is_empty() {
            return None;
        }
        let alias = self
            .config
            .aliases
            .iter()
            .find(|(prefix, _)| base == prefix.as_str() || base.starts_with(&format!("{}/", prefix)));
        let path = if let Some(rooted) = base.strip_prefix('/') {
            canon_path(rooted)
        } else if let Some((prefix, dir)) = alias {
            join(dir, base[prefix.len()..].trim_start_matches('/'))
        } else {
            join(dirname(from), base)
        };
        if !is_normalized_relative(&path) {
            return None;
        }

        let (_, from_ext) = split_name(from);
        let (stem, ext) = split_name(&path);
        let dir = dirname(&path);
        let mut candidates = vec![path.clone()];
        if ext.is_empty() && !from_ext.is_empty() {
            candidates.push(format!("{}.{}", path, from_ext));
            candidates.push(join(dir, &format!("_{}.{}", stem, from_ext)));
        } else if !ext.is_empty() {
            candidates.push(join(dir, &format!("_{}.{}", stem, ext)));
        }
        candidates.into_iter().find(|c| self.exists(c))
    }

    /// Scan a source node for references and point its dependencies at
    /// them.  Returns the nodes created for newly discovered files.
    fn scan_node(&mut self, id: NodeId) -> Result<Vec<NodeId>, Error> {
        if self.graph.node(id).rule.is_none() || self.graph.node(id).kind != NodeKind::Source {
            return Ok(Vec::new());
        }
        let path = self.graph.path(id).to_string();
        let content = self.read(&path)?;
        let chain = self.chain_of(id);
        let mut written: Vec<String> = Vec::new();
        for stage in chain.stages() {
            for reference in stage.scan(&content) {
                if !written.contains(&reference) {
                    written.push(reference);
                }
            }
        }

        let mut created = Vec::new();
        let mut references = Vec::with_capacity(written.len());
        let mut targets: Vec<NodeId> = Vec::with_capacity(written.len());
        for reference in written {
            let target = match self.resolve_reference(&path, &reference) {
                Some(target) => target,
                None => {
                    return Err(Error::MissingReference {
                        from: path,
                        reference,
                    })
                }
            };
            let existed = self.graph.lookup(&target).is_some();
            let target_id = self.add_source(&target)?;
            if !existed {
                created.push(target_id);
            }
            if !targets.contains(&target_id) {
                targets.push(target_id);
            }
            references.push((reference, target_id));
        }

        // Keep edges to side artifacts of producers still referenced; they
        // were added when this node was last built.
        let mut deps = targets.clone();
        for &dep in self.graph.node(id).deps() {
            if let NodeKind::Side { producer, .. } = self.graph.node(dep).kind {
                if targets.contains(&producer) {
                    deps.push(dep);
                }
            }
        }
        self.graph.set_deps(id, &deps)?;
        self.references.insert(id, references);
        Ok(created)
    }

    /// Schedule `nodes` (ordered producers first) and run them to
    /// completion.  Without keep_going, scheduling stops at the first
    /// failure.  Changes seen on `feed` while building restart unfinished
    /// nodes, or are queued for the next round.
    fn build_nodes(
        &mut self,
        nodes: &[NodeId],
        keep_going: bool,
        mut feed: Option<&mut ChangeFeed>,
    ) -> BuildReport {
        self.phase = Phase::Building;
        if let Some(feed) = feed.as_deref_mut() {
            self.track_all(feed);
        }
        let mut report = BuildReport::default();
        let mut work = Work::new(&self.graph, nodes);
        let mut runner = Runner::new(self.parallelism, self.chain.clone());
        let mut stopping = false;
        loop {
            while !stopping && runner.can_start_more() {
                let id = match work.next_ready() {
                    Some(id) => id,
                    None => break,
                };
                if let Err(err) = self.start_node(&mut work, &mut runner, &mut report, id) {
                    stopping |= self.fail(&mut work, &mut report, id, err, keep_going);
                }
            }
            self.progress.update(work.counts());
            if !runner.is_running() {
                break;
            }

            let task = runner.wait(Duration::from_millis(100));
            if let Some(feed) = feed.as_deref_mut() {
                let changed = feed.poll();
                if !changed.is_empty() {
                    stopping |=
                        self.note_changes(&mut work, &mut runner, &mut report, changed, keep_going);
                }
            }
            let task = match task {
                Some(task) => task,
                None => continue,
            };
            if !work.is_current(task.node, task.generation) {
                // Restarted after an edit; a newer run is queued.
                continue;
            }
            let id = task.node;
            let result = task
                .result
                .map_err(Error::from)
                .and_then(|value| self.finish_node(id, task.origin, value));
            match result {
                Ok(()) => {
                    report.built.push(self.graph.path(id).to_string());
                    work.finished(&self.graph, id, true);
                }
                Err(err) => stopping |= self.fail(&mut work, &mut report, id, err, keep_going),
            }
        }
        self.progress.update(work.counts());
        report
    }

    /// Record a failure; returns whether scheduling should stop.
    fn fail(
        &mut self,
        work: &mut Work,
        report: &mut BuildReport,
        id: NodeId,
        err: Error,
        keep_going: bool,
    ) -> bool {
        let path = self.graph.path(id).to_string();
        self.progress.task_finished(&path, Err(&err));
        for skipped in work.finished(&self.graph, id, false) {
            report.skipped.push(self.graph.path(skipped).to_string());
        }
        report.failures.push(err);
        !keep_going
    }

    /// Apply changes seen while building.  A node that hasn't finished is
    /// rescanned and requeued, behind any files it newly references, and an
    /// in-flight run of it is cancelled.  Changes to anything else wait for
    /// the next round.  Returns whether scheduling should stop.
    fn note_changes(
        &mut self,
        work: &mut Work,
        runner: &mut Runner,
        report: &mut BuildReport,
        changed: Vec<String>,
        keep_going: bool,
    ) -> bool {
        let mut stopping = false;
        for path in changed {
            let id = match self.graph.lookup(&path) {
                Some(id) if self.graph.node(id).kind == NodeKind::Source => id,
                _ => {
                    self.pending.insert(path);
                    continue;
                }
            };
            let running = match work.state(id) {
                Some(NodeState::Running) => true,
                Some(NodeState::Want) | Some(NodeState::Ready) => false,
                _ => {
                    self.pending.insert(path);
                    continue;
                }
            };
            if running {
                runner.cancel(id);
            }
            if let Some(old) = self.origins.remove(&id) {
                self.chain.cache().invalidate_origin(old);
            }
            match self.rescan(work, id) {
                Ok(()) => {
                    work.restart(&self.graph, id);
                    if running {
                        self.progress.log(&format!("{}: changed while building, restarting", path));
                    }
                }
                Err(err) => stopping |= self.fail(work, report, id, err, keep_going),
            }
        }
        stopping
    }

    /// Rescan a node that changed mid-build, adding the files it now
    /// references for the first time to the build.
    fn rescan(&mut self, work: &mut Work, id: NodeId) -> Result<(), Error> {
        let mut created = Vec::new();
        let mut queue: VecDeque<NodeId> = self.scan_node(id)?.into();
        while let Some(new) = queue.pop_front() {
            created.push(new);
            queue.extend(self.scan_node(new)?);
        }
        for new in self.graph.topo_order() {
            if created.contains(&new) {
                work.add(&self.graph, new);
            }
        }
        Ok(())
    }

    fn start_node(
        &mut self,
        work: &mut Work,
        runner: &mut Runner,
        report: &mut BuildReport,
        id: NodeId,
    ) -> Result<(), Error> {
        if let NodeKind::Side { .. } = self.graph.node(id).kind {
            // Emitted along with the producer, which finished before this.
            report.built.push(self.graph.path(id).to_string());
            work.finished(&self.graph, id, true);
            return Ok(());
        }
        let path = self.graph.path(id).to_string();
        let content = self.read(&path)?;
        let chain = self.chain_of(id);
        self.progress.task_started(&path, &chain);
        runner.start(Job {
            node: id,
            generation: work.generation(id),
            path,
            content,
            chain,
            mode: self.mode,
        });
        Ok(())
    }

    /// Output URL for a reference to `target`, relative to `from_dir`.
    /// A target whose own content was extracted is referenced through its
    /// first side artifact.
    fn reference_url(&self, target: NodeId, from_dir: &str) -> Option<String> {
        let artifact = self.graph.node(target).artifact()?;
        let output = match &artifact.output {
            Some(output) => output.clone(),
            None => self
                .graph
                .side_artifacts(target)
                .into_iter()
                .find_map(|a| a.output.clone())?,
        };
        Some(relative_url(from_dir, &output))
    }

    fn rewrite_references(&self, id: NodeId, from_dir: &str, content: &[u8]) -> Vec<u8> {
        let refs = match self.references.get(&id) {
            Some(refs) if !refs.is_empty() => refs,
            _ => return content.to_vec(),
        };
        let mut text = match std::str::from_utf8(content) {
            Ok(text) => text.to_string(),
            Err(_) => return content.to_vec(),
        };
        for (reference, target) in refs {
            let url = match self.reference_url(*target, from_dir) {
                Some(url) => url,
                None => continue,
            };
            let suffix = match reference.find(|c| c == '?' || c == '#') {
                Some(idx) => &reference[idx..],
                None => "",
            };
            text = replace_quoted(&text, reference, &format!("{}{}", url, suffix));
        }
        text.into_bytes()
    }

    /// Write an artifact's content unless it is empty or not for emission.
    fn emit(&self, output: Option<&str>, content: &[u8]) -> Result<Option<String>, Error> {
        let output = match output {
            Some(output) if !content.is_empty() => output,
            _ => return Ok(None),
        };
        self.fs
            .write(&under(&self.config.out, output), content)
            .map_err(|err| Error::io(output, err))?;
        Ok(Some(output.to_string()))
    }

    /// Turn a finished chain result into artifacts: side nodes first, then
    /// the node's own output with references rewritten.
    fn finish_node(
        &mut self,
        id: NodeId,
        origin: ContentHash,
        value: Arc<Transformed>,
    ) -> Result<(), Error> {
        let path = self.graph.path(id).to_string();
        let rule_index = self.graph.node(id).rule;
        self.origins.insert(id, origin);

        let (emit, template, outdir) = match self.rule(id) {
            Some(rule) => (
                rule.emit,
                rule.name_template(self.mode).clone(),
                rule.outdir.clone(),
            ),
            None => (true, NameTemplate::default(), None),
        };

        let old_sides = self.graph.side_nodes(id).to_vec();
        for (index, side) in value.side.iter().enumerate() {
            let side_path = format!("{}#{}", path, index);
            let kind = NodeKind::Side {
                producer: id,
                index,
            };
            let side_id = self.graph.add_node(&side_path, kind, rule_index, &[])?;
            let hash = ContentHash::of(&side.content);
            let name = output_path(&template, outdir.as_deref(), &path, &side.ext, &hash);
            let output = self.emit(Some(name.as_str()).filter(|_| emit), &side.content)?;
            let artifact = Artifact {
                source: side_path.clone(),
                output,
                content: Arc::new(side.content.clone()),
                hash,
                depends_on: vec![path.clone()],
            };
            self.progress.task_finished(&side_path, Ok(&artifact));
            self.graph.set_artifact(side_id, artifact);
        }
        for stale in old_sides.into_iter().skip(value.side.len()) {
            self.graph.clear_artifact(stale);
        }

        // A consumer depends on what its producers' side outputs became,
        // e.g. the html page on the css extracted from its stylesheet.
        for dep in self.graph.node(id).deps().to_vec() {
            for side in self.graph.side_nodes(dep).to_vec() {
                self.graph.add_edge(id, side)?;
            }
        }

        let rule = self.rule(id);
        let rewrites = rule.map_or(false, |r| r.chain(self.mode).stages().iter().any(|s| s.rewrites()));
        let content = if rewrites {
            self.rewrite_references(id, output_dir(rule, &path), &value.content)
        } else {
            value.content.clone()
        };
        let hash = ContentHash::of(&content);
        let name = match rule {
            Some(rule) => {
                let (_, source_ext) = split_name(&path);
                let ext = rule.ext.as_deref().unwrap_or(source_ext);
                Some(rule.output_path(self.mode, &path, ext, &hash)).filter(|_| rule.emit)
            }
            None => Some(path.clone()),
        };
        let output = self.emit(name.as_deref(), &content)?;
        let depends_on = self
            .graph
            .node(id)
            .deps()
            .iter()
            .map(|&d| self.graph.path(d).to_string())
            .collect();
        let artifact = Artifact {
            source: path.clone(),
            output,
            content: Arc::new(content),
            hash,
            depends_on,
        };
        self.progress.task_finished(&path, Ok(&artifact));
        self.graph.set_artifact(id, artifact);
        Ok(())
    }

    /// Rebuild after `changed` paths (relative to the root) changed.  Only
    /// the changed nodes and their transitive dependents are rebuilt; files
    /// whose content is unchanged are ignored.  Keeps going past failures.
    pub fn rebuild(&mut self, changed: &[String]) -> BuildReport {
        self.rebuild_with(changed, None)
    }

    fn rebuild_with(&mut self, changed: &[String], feed: Option<&mut ChangeFeed>) -> BuildReport {
        let mut paths: BTreeSet<String> = changed.iter().map(|p| canon_path(p)).collect();
        paths.extend(std::mem::take(&mut self.pending));
        if !self.discovered {
            return match self.full_build(true, feed) {
                Ok(report) => report,
                Err(err) => {
                    self.progress.task_finished(err.path().unwrap_or(""), Err(&err));
                    BuildReport {
                        failures: vec![err],
                        ..BuildReport::default()
                    }
                }
            };
        }

        self.phase = Phase::Discovering;
        let mut report = BuildReport::default();
        let mut roots: Vec<NodeId> = Vec::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();
        for path in &paths {
            let id = match self.graph.lookup(path) {
                Some(id) if self.graph.node(id).kind == NodeKind::Source => id,
                _ => continue,
            };
            match self.read(path) {
                Ok(content) => {
                    let hash = ContentHash::of(&content);
                    if let Some(&old) = self.origins.get(&id) {
                        if old == hash {
                            continue;
                        }
                        self.chain.cache().invalidate_origin(old);
                    }
                }
                // Rebuilding reports the read failure.
                Err(_) => {}
            }
            roots.push(id);
            queue.push_back(id);
        }

        // Re-discover references of changed files, and anything new they
        // pull in.
        let mut failed: Vec<NodeId> = Vec::new();
        let mut seen = BTreeSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            match self.scan_node(id) {
                Ok(created) => {
                    roots.extend(created.iter().copied());
                    queue.extend(created);
                }
                Err(Error::Io { .. }) => {}
                Err(err) => {
                    let path = self.graph.path(id).to_string();
                    self.progress.task_finished(&path, Err(&err));
                    report.failures.push(err);
                    failed.push(id);
                }
            }
        }

        self.prune();
        roots.retain(|&id| self.graph.contains(id));
        failed.retain(|&id| self.graph.contains(id));

        // Nodes that failed or were skipped last round are retried.
        let dirty: Vec<NodeId> = self
            .graph
            .ids()
            .filter(|&id| {
                let node = self.graph.node(id);
                node.kind == NodeKind::Source && node.dirty && !roots.contains(&id)
            })
            .collect();
        roots.extend(dirty);

        let mut affected = self.graph.affected_set_many(&roots);
        if !failed.is_empty() {
            let blocked: BTreeSet<NodeId> =
                self.graph.affected_set_many(&failed).into_iter().collect();
            for &id in &blocked {
                if !failed.contains(&id) {
                    report.skipped.push(self.graph.path(id).to_string());
                }
            }
            affected.retain(|id| !blocked.contains(id));
        }
        for &id in &roots {
            self.graph.mark_dirty(id);
        }
        let round = self.build_nodes(&affected, true, feed);
        report.built.extend(round.built);
        report.failures.extend(round.failures);
        report.skipped.extend(round.skipped);
        report
    }

    /// Every node's emitted outputs, grouped by source, plus this round's
    /// results.
    pub fn manifest(&self, report: &BuildReport) -> Manifest {
        let mut manifest = Manifest::default();
        for id in self.graph.ids() {
            let node = self.graph.node(id);
            let source = match node.kind {
                NodeKind::Source => id,
                NodeKind::Side { producer, .. } => producer,
            };
            let artifact = match node.artifact() {
                Some(artifact) => artifact,
                None => continue,
            };
            let outputs = manifest
                .outputs
                .entry(self.graph.path(source).to_string())
                .or_default();
            if let Some(output) = &artifact.output {
                outputs.push(output.clone());
            }
        }
        manifest.rebuilt = report.built.clone();
        manifest.failed = report
            .failures
            .iter()
            .map(|err| err.path().unwrap_or("").to_string())
            .collect();
        manifest
    }

    /// Point the feed at the entries, copy targets and every source node.
    fn track_all(&self, feed: &mut ChangeFeed) {
        let mut paths: Vec<String> = self
            .config
            .entries
            .iter()
            .chain(self.config.copies.iter())
            .cloned()
            .collect();
        for id in self.graph.ids() {
            if self.graph.node(id).kind == NodeKind::Source {
                paths.push(self.graph.path(id).to_string());
            }
        }
        feed.set_watched(paths);
    }

    /// Build, then rebuild on every change until `stop` returns true.
    /// Changes come from watching the source root on disk, when the file
    /// system is a real one, and from `events`.  Failures are reported to
    /// `progress` and the server; they never end the loop.
    pub fn watch(
        &mut self,
        server: &mut dyn DevServer,
        events: Option<mpsc::Receiver<String>>,
        stop: &dyn Fn() -> bool,
    ) {
        let mut feed = ChangeFeed::new(&self.config.root);
        if let Some(events) = events {
            feed = feed.with_events(events);
        }
        if self.fs.is_on_disk() {
            if let Err(err) = feed.watch_disk(self.config.debounce) {
                self.progress
                    .log(&format!("watch {}: {}", self.config.root.display(), err));
            }
        }
        let report = self.rebuild_with(&[], Some(&mut feed));
        self.finish_round(&mut feed, server, &report);

        while !stop() {
            let changed = if self.pending.is_empty() {
                feed.wait(self.config.poll)
            } else {
                feed.poll()
            };
            if changed.is_empty() && self.pending.is_empty() {
                continue;
            }
            if !changed.is_empty() {
                self.progress.log(&format!("changed: {}", changed.join(" ")));
            }
            let report = self.rebuild_with(&changed, Some(&mut feed));
            self.finish_round(&mut feed, server, &report);
        }
        self.phase = Phase::Idle;
    }

    fn finish_round(&mut self, feed: &mut ChangeFeed, server: &mut dyn DevServer, report: &BuildReport) {
        self.phase = Phase::Watching;
        self.track_all(feed);
        let done = report.built.len();
        let failed = report.failures.len();
        if failed > 0 {
            self.progress
                .log(&format!("{} built, {} failed; watching for changes", done, failed));
        }
        server.rebuild_complete(&self.manifest(report));
    }
}
