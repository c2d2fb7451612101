use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};
use crate::lifecycle::Phase;

pub type TaskId = String;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub label: String,
    pub module: String,
    pub phase: Phase,
    /// Task ids or provide tokens this task runs after. A trailing `?` marks
    /// the edge optional: it is dropped when nothing provides it.
    pub after: Vec<TaskId>,
    pub provides: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Plan {
    tasks: BTreeMap<TaskId, Task>,
}

impl Plan {
    pub fn add(&mut self, task: Task) -> Result<()> {
        if self.tasks.contains_key(&task.id) {
            return Err(Error::msg(format!("duplicate task id '{}'", task.id)));
        }
        self.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn provides_index(&self) -> Result<BTreeMap<&str, &str>> {
        let mut out: BTreeMap<&str, &str> = BTreeMap::new();
        for (id, task) in &self.tasks {
            for p in &task.provides {
                if let Some(existing) = out.insert(p.as_str(), id.as_str()) {
                    return Err(Error::msg(format!(
                        "provide token '{p}' is produced by both '{existing}' and '{id}'"
                    )));
                }
            }
        }
        Ok(out)
    }

    fn resolve_dep<'a>(
        &'a self,
        provides: &BTreeMap<&'a str, &'a str>,
        dep: &'a str,
    ) -> Result<Option<&'a str>> {
        let (dep, optional) = dep
            .strip_suffix('?')
            .map(|d| (d, true))
            .unwrap_or((dep, false));
        if self.tasks.contains_key(dep) {
            return Ok(Some(dep));
        }
        if let Some(&provider) = provides.get(dep) {
            return Ok(Some(provider));
        }
        if optional {
            return Ok(None);
        }
        Err(Error::msg(format!("unknown dependency '{dep}'")))
    }

    /// Resolved `(dependency, dependent)` edges.
    fn edges(&self) -> Result<Vec<(&str, &str)>> {
        let provides = self.provides_index()?;
        let mut out = Vec::new();
        for (id, task) in &self.tasks {
            for dep in &task.after {
                let resolved = self.resolve_dep(&provides, dep).map_err(|e| {
                    Error::msg(format!("task '{id}' has invalid dependency '{dep}': {e}"))
                })?;
                if let Some(dep_id) = resolved {
                    out.push((dep_id, id.as_str()));
                }
            }
        }
        Ok(out)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Drop every task whose phase is not in `phases`.
    pub fn retain_phases(&mut self, phases: &[Phase]) {
        self.tasks.retain(|_, t| phases.contains(&t.phase));
    }

    /// Topological order; ready tasks run in (phase, id) order so the result
    /// is stable.
    pub fn ordered(&self) -> Result<Vec<&Task>> {
        let mut incoming: BTreeMap<&str, usize> =
            self.tasks.keys().map(|k| (k.as_str(), 0)).collect();
        let mut outgoing: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for (dep, id) in self.edges()? {
            if outgoing.entry(dep).or_default().insert(id)
                && let Some(n) = incoming.get_mut(id)
            {
                *n += 1;
            }
        }

        let rank = |id: &str| (self.tasks.get(id).map(|t| t.phase), id.to_string());
        let mut ready: BTreeSet<(Option<Phase>, String)> = incoming
            .iter()
            .filter_map(|(k, v)| (*v == 0).then(|| rank(*k)))
            .collect();
        let mut out = Vec::with_capacity(self.tasks.len());
        while let Some((_, n)) = ready.pop_first() {
            if let Some(task) = self.tasks.get(n.as_str()) {
                out.push(task);
            }
            for &m in outgoing.get(n.as_str()).into_iter().flatten() {
                if let Some(slot) = incoming.get_mut(m) {
                    *slot -= 1;
                    if *slot == 0 {
                        ready.insert(rank(m));
                    }
                }
            }
        }

        if out.len() != self.tasks.len() {
            let remaining: Vec<&str> = incoming
                .iter()
                .filter_map(|(k, v)| (*v > 0).then_some(*k))
                .collect();
            return Err(Error::msg(format!(
                "task graph contains a cycle; remaining nodes: {}",
                remaining.join(", ")
            )));
        }
        Ok(out)
    }

    /// Order the plan and check that phases never run backwards.
    pub fn lifecycle_order(&self) -> Result<Vec<&Task>> {
        let ordered = self.ordered()?;
        for pair in ordered.windows(2) {
            if pair[1].phase < pair[0].phase {
                return Err(Error::msg(format!(
                    "task '{}' ({}) is ordered after '{}' ({}), breaking lifecycle order",
                    pair[1].id, pair[1].phase, pair[0].id, pair[0].phase
                )));
            }
        }
        Ok(ordered)
    }

    pub fn to_dot(&self) -> Result<String> {
        let mut out = String::from("digraph plan {\n  rankdir=LR;\n");
        for task in self.tasks.values() {
            out.push_str(&format!(
                "  \"{}\" [label=\"{}\\n{}:{}\"];\n",
                task.id, task.label, task.module, task.phase
            ));
        }
        for (dep, id) in self.edges()? {
            out.push_str(&format!("  \"{dep}\" -> \"{id}\";\n"));
        }
        out.push_str("}\n");
        Ok(out)
    }
}
