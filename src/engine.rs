// vtmctl - CLI for the Virtual Traffic Manager REST API
// Copyright (C) 2024 Mathias Uhl <mathiasuhl@gmx.de>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Select, compare, and write back one field across matching resources.
//!
//! Every mutating command is the same loop: list a collection, keep the names
//! a pattern accepts, fetch each match, decide whether the field differs from
//! the desired value, report the decision, and write the resource back unless
//! this is a dry run. [`FieldChange`] describes one command's field;
//! [`ChangeEngine::run`] is the loop.

use crate::client::{RemoteError, ResourceClient};
use crate::pattern::Matcher;
use crate::report::{self, Reporter};
use crate::resource::{Collection, FieldError, Resource, ScalarField};
use crate::rules::{self, Direction, RuleState};
use std::io::{self, Write};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<T> {
    NoChange,
    Update { current: T, desired: T },
}

pub fn plan_scalar_change<T: PartialEq + Clone>(current: &T, desired: &T) -> Decision<T> {
    if current == desired {
        Decision::NoChange
    } else {
        Decision::Update {
            current: current.clone(),
            desired: desired.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleToggle {
    pub rules: Vec<String>,
    pub changed: bool,
    pub matched_any: bool,
}

/// Applies `direction` to every rule whose display name ends with
/// `target_suffix`. Length and order are preserved; only the `/` prefix of
/// matching entries can change.
pub fn plan_rule_toggle(rules: &[String], target_suffix: &str, direction: Direction) -> RuleToggle {
    let mut changed = false;
    let mut matched_any = false;
    let updated = rules
        .iter()
        .map(|raw| {
            if !rules::matches_target(raw, target_suffix) {
                return raw.clone();
            }
            matched_any = true;
            let toggled = direction.apply(raw);
            if toggled != *raw {
                changed = true;
            }
            toggled
        })
        .collect();

    RuleToggle {
        rules: updated,
        changed,
        matched_any,
    }
}

#[derive(Debug)]
pub enum ApplyResult {
    Unchanged,
    WouldChange,
    Changed,
    Failed(RemoteError),
}

/// Writes `decision` back through `client`, at most once.
pub fn apply<C, T>(
    client: &mut C,
    resource: &mut Resource,
    setter: impl FnOnce(&mut Resource, T),
    decision: Decision<T>,
    dry_run: bool,
) -> ApplyResult
where
    C: ResourceClient + ?Sized,
{
    match decision {
        Decision::NoChange => ApplyResult::Unchanged,
        Decision::Update { .. } if dry_run => ApplyResult::WouldChange,
        Decision::Update { desired, .. } => {
            setter(resource, desired);
            match client.set(resource) {
                Ok(()) => ApplyResult::Changed,
                Err(err) => ApplyResult::Failed(err),
            }
        }
    }
}

/// What a command found on one resource before writing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan<T> {
    /// The targeted entry does not exist on this resource.
    Absent,
    Decided(Decision<T>),
}

/// One command's view of a field: where it lives, how to compare it, how to
/// write it, and how to describe the outcome.
pub trait FieldChange {
    type Value: Clone;

    fn collection(&self) -> Collection;
    fn plan(&self, resource: &Resource) -> Result<Plan<Self::Value>, FieldError>;
    fn write(&self, resource: &mut Resource, value: Self::Value);
    fn line(&self, name: &str, plan: &Plan<Self::Value>) -> String;
}

#[derive(Debug, Clone)]
pub struct ScalarChange {
    pub field: ScalarField,
    pub desired: u64,
}

impl FieldChange for ScalarChange {
    type Value = u64;

    fn collection(&self) -> Collection {
        self.field.collection
    }

    fn plan(&self, resource: &Resource) -> Result<Plan<u64>, FieldError> {
        let current = resource.scalar(&self.field)?;
        Ok(Plan::Decided(plan_scalar_change(&current, &self.desired)))
    }

    fn write(&self, resource: &mut Resource, value: u64) {
        resource.set_scalar(&self.field, value);
    }

    fn line(&self, name: &str, plan: &Plan<u64>) -> String {
        match plan {
            Plan::Decided(Decision::Update { current, desired }) => {
                report::scalar_change(name, *current, *desired)
            }
            // Unchanged means the current value already equals the desired one.
            _ => report::scalar_unchanged(name, self.desired),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuleChange {
    pub target: String,
    pub direction: Direction,
}

impl FieldChange for RuleChange {
    type Value = Vec<String>;

    fn collection(&self) -> Collection {
        Collection::VirtualServers
    }

    fn plan(&self, resource: &Resource) -> Result<Plan<Vec<String>>, FieldError> {
        let current = resource.request_rules()?;
        let toggle = plan_rule_toggle(&current, &self.target, self.direction);
        Ok(match toggle {
            RuleToggle {
                matched_any: false, ..
            } => Plan::Absent,
            RuleToggle { changed: false, .. } => Plan::Decided(Decision::NoChange),
            RuleToggle { rules, .. } => Plan::Decided(Decision::Update {
                current,
                desired: rules,
            }),
        })
    }

    fn write(&self, resource: &mut Resource, value: Vec<String>) {
        resource.set_request_rules(value);
    }

    fn line(&self, name: &str, plan: &Plan<Vec<String>>) -> String {
        let target = self.direction.target_state();
        match plan {
            Plan::Absent => report::no_rule(name),
            Plan::Decided(Decision::NoChange) => report::rule_unchanged(name, &self.target, target),
            Plan::Decided(Decision::Update { .. }) => {
                report::rule_change(name, &self.target, opposite(target), target)
            }
        }
    }
}

fn opposite(state: RuleState) -> RuleState {
    match state {
        RuleState::Enabled => RuleState::Disabled,
        RuleState::Disabled => RuleState::Enabled,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Stop at the first failed write. Earlier writes stay committed.
    #[default]
    Abort,
    /// Keep going and fail once every resource has been processed.
    Continue,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    pub unchanged: usize,
    pub would_change: usize,
    pub changed: usize,
    pub absent: usize,
    pub failed: usize,
}

impl Summary {
    fn record<T>(&mut self, plan: &Plan<T>, result: &ApplyResult) {
        match (plan, result) {
            (Plan::Absent, _) => self.absent += 1,
            (_, ApplyResult::Unchanged) => self.unchanged += 1,
            (_, ApplyResult::WouldChange) => self.would_change += 1,
            (_, ApplyResult::Changed) => self.changed += 1,
            (_, ApplyResult::Failed(_)) => self.failed += 1,
        }
    }

    pub fn processed(&self) -> usize {
        self.unchanged + self.would_change + self.changed + self.absent + self.failed
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error("writing report: {0}")]
    Output(#[from] io::Error),
    #[error("{failed} of {attempted} writes failed")]
    Incomplete { failed: usize, attempted: usize },
}

/// Rules of one virtual server that matched a rule pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleListing {
    pub name: String,
    pub rules: Vec<(String, RuleState)>,
}

pub struct ChangeEngine<'c, C: ResourceClient + ?Sized> {
    client: &'c mut C,
    dry_run: bool,
    policy: FailurePolicy,
}

impl<'c, C: ResourceClient + ?Sized> ChangeEngine<'c, C> {
    pub fn new(client: &'c mut C, dry_run: bool, policy: FailurePolicy) -> Self {
        Self {
            client,
            dry_run,
            policy,
        }
    }

    /// Lists `collection` once and keeps the names `matcher` accepts.
    pub fn select(&mut self, collection: Collection, matcher: &Matcher) -> Result<Vec<String>, RemoteError> {
        let names = self.client.list(collection)?;
        let selected: Vec<String> = matcher
            .select(&names)
            .into_iter()
            .map(str::to_string)
            .collect();
        if selected.is_empty() {
            warn!(
                "no {} matches `{}` ({} listed)",
                collection.noun(),
                matcher.as_str(),
                names.len()
            );
        }
        Ok(selected)
    }

    pub fn run<F, W>(
        &mut self,
        change: &F,
        matcher: &Matcher,
        reporter: &mut Reporter<W>,
    ) -> Result<Summary, EngineError>
    where
        F: FieldChange,
        W: Write,
    {
        let collection = change.collection();
        let mut summary = Summary::default();

        for name in self.select(collection, matcher)? {
            info!("Processing {} {}", collection.noun(), name);
            let mut resource = self.client.get(collection, &name)?;
            let plan = change.plan(&resource).map_err(RemoteError::from)?;
            reporter.line(&change.line(&name, &plan))?;

            let result = match &plan {
                Plan::Absent => ApplyResult::Unchanged,
                Plan::Decided(decision) => apply(
                    &mut *self.client,
                    &mut resource,
                    |r, v| change.write(r, v),
                    decision.clone(),
                    self.dry_run,
                ),
            };
            summary.record(&plan, &result);

            if let ApplyResult::Failed(err) = result {
                match self.policy {
                    FailurePolicy::Abort => return Err(err.into()),
                    FailurePolicy::Continue => error!("{}: {}", name, err),
                }
            }
        }

        info!(
            changed = summary.changed,
            would_change = summary.would_change,
            unchanged = summary.unchanged,
            absent = summary.absent,
            failed = summary.failed,
            "processed {} {}(s)",
            summary.processed(),
            collection.noun()
        );

        if summary.failed > 0 {
            return Err(EngineError::Incomplete {
                failed: summary.failed,
                attempted: summary.failed + summary.changed,
            });
        }
        Ok(summary)
    }

    pub fn read_scalar(
        &mut self,
        field: &ScalarField,
        matcher: &Matcher,
    ) -> Result<Vec<(String, u64)>, RemoteError> {
        let mut values = Vec::new();
        for name in self.select(field.collection, matcher)? {
            let resource = self.client.get(field.collection, &name)?;
            let value = resource.scalar(field)?;
            values.push((name, value));
        }
        Ok(values)
    }

    pub fn rule_states(
        &mut self,
        vservers: &Matcher,
        rule_pattern: &Matcher,
    ) -> Result<Vec<RuleListing>, RemoteError> {
        let mut listings = Vec::new();
        for name in self.select(Collection::VirtualServers, vservers)? {
            let resource = self.client.get(Collection::VirtualServers, &name)?;
            let rules = resource
                .request_rules()?
                .iter()
                .filter(|raw| rule_pattern.matches(rules::display_name(raw)))
                .map(|raw| (rules::display_name(raw).to_string(), RuleState::of(raw)))
                .collect();
            listings.push(RuleListing { name, rules });
        }
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{CONNECTION_TIMEOUT, MAX_REPLY_TIME};
    use serde_json::json;
    use std::collections::HashMap;

    /// In-memory store that records every write.
    #[derive(Default)]
    struct FakeClient {
        listings: HashMap<Collection, Vec<String>>,
        documents: HashMap<(Collection, String), serde_json::Value>,
        writes: Vec<Resource>,
        fail_writes_for: Vec<String>,
    }

    impl FakeClient {
        fn with(mut self, collection: Collection, name: &str, properties: serde_json::Value) -> Self {
            self.listings
                .entry(collection)
                .or_default()
                .push(name.to_string());
            self.documents.insert(
                (collection, name.to_string()),
                json!({ "properties": properties }),
            );
            self
        }
    }

    impl ResourceClient for FakeClient {
        fn list(&mut self, collection: Collection) -> Result<Vec<String>, RemoteError> {
            Ok(self.listings.get(&collection).cloned().unwrap_or_default())
        }

        fn get(&mut self, collection: Collection, name: &str) -> Result<Resource, RemoteError> {
            let doc = self.documents[&(collection, name.to_string())].clone();
            Ok(Resource::from_document(collection, name, doc)?)
        }

        fn set(&mut self, resource: &Resource) -> Result<(), RemoteError> {
            if self.fail_writes_for.contains(&resource.name) {
                return Err(RemoteError::Status {
                    status: 500,
                    message: format!("write to {} rejected", resource.name),
                });
            }
            self.documents.insert(
                (resource.collection, resource.name.clone()),
                resource.to_document(),
            );
            self.writes.push(resource.clone());
            Ok(())
        }
    }

    fn strings(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn output(reporter: Reporter<Vec<u8>>) -> String {
        String::from_utf8(reporter.into_inner()).unwrap()
    }

    fn rules_of(client: &FakeClient, name: &str) -> serde_json::Value {
        client.documents[&(Collection::VirtualServers, name.to_string())]["properties"]["basic"]
            ["request_rules"]
            .clone()
    }

    #[test]
    fn scalar_plan_is_exact_equality() {
        for x in [0u64, 1, 30, u64::MAX] {
            assert_eq!(plan_scalar_change(&x, &x), Decision::NoChange);
        }
        assert_eq!(
            plan_scalar_change(&45u64, &60),
            Decision::Update {
                current: 45,
                desired: 60
            }
        );
    }

    #[test]
    fn rule_toggle_preserves_length_and_untouched_entries() {
        let rules = strings(&["keep-me", "/ns/block-tor", "other", "block-tor"]);
        let toggle = plan_rule_toggle(&rules, "block-tor", Direction::Disable);
        assert_eq!(
            toggle.rules,
            strings(&["keep-me", "/ns/block-tor", "other", "/block-tor"])
        );
        assert!(toggle.changed);
        assert!(toggle.matched_any);

        let again = plan_rule_toggle(&toggle.rules, "block-tor", Direction::Disable);
        assert_eq!(again.rules, toggle.rules);
        assert!(!again.changed);
        assert!(again.matched_any);
    }

    #[test]
    fn rule_toggle_without_match() {
        let rules = strings(&["a", "/b"]);
        let toggle = plan_rule_toggle(&rules, "zzz", Direction::Enable);
        assert_eq!(toggle.rules, rules);
        assert!(!toggle.changed);
        assert!(!toggle.matched_any);
    }

    #[test]
    fn enable_rule_scenario() {
        let mut client = FakeClient::default()
            .with(Collection::VirtualServers, "srv-a", json!({"basic": {"request_rules": ["/block-tor"]}}))
            .with(Collection::VirtualServers, "srv-b", json!({"basic": {"request_rules": ["block-tor"]}}))
            .with(Collection::VirtualServers, "srv-c", json!({"basic": {"request_rules": ["other-rule"]}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = RuleChange {
            target: "block-tor".into(),
            direction: Direction::Enable,
        };

        let summary = ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("srv-*").unwrap(), &mut reporter)
            .unwrap();

        assert_eq!(
            output(reporter),
            "srv-a:\tblock-tor [disabled] -> [enabled]\n\
             srv-b:\tblock-tor [enabled] (no change)\n\
             srv-c:\t(no rule)\n"
        );
        assert_eq!(summary.changed, 1);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.absent, 1);
        assert_eq!(client.writes.len(), 1);
        assert_eq!(client.writes[0].name, "srv-a");
        assert_eq!(rules_of(&client, "srv-a"), json!(["block-tor"]));
    }

    #[test]
    fn disable_rule_only_touches_matching_vservers() {
        let mut client = FakeClient::default()
            .with(Collection::VirtualServers, "web-1", json!({"basic": {"request_rules": ["geo", "sec/block-tor"]}}))
            .with(Collection::VirtualServers, "db-1", json!({"basic": {"request_rules": ["block-tor"]}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = RuleChange {
            target: "block-tor".into(),
            direction: Direction::Disable,
        };

        ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("web-*").unwrap(), &mut reporter)
            .unwrap();

        assert_eq!(output(reporter), "web-1:\tblock-tor [enabled] -> [disabled]\n");
        assert_eq!(rules_of(&client, "web-1"), json!(["geo", "/sec/block-tor"]));
        assert_eq!(rules_of(&client, "db-1"), json!(["block-tor"]));
    }

    #[test]
    fn set_timeout_without_differences_writes_nothing() {
        let mut client = FakeClient::default()
            .with(Collection::VirtualServers, "a", json!({"connection": {"timeout": 30}}))
            .with(Collection::VirtualServers, "b", json!({"connection": {"timeout": 30}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: CONNECTION_TIMEOUT,
            desired: 30,
        };

        let summary = ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("*").unwrap(), &mut reporter)
            .unwrap();

        assert!(client.writes.is_empty());
        assert_eq!(summary.unchanged, 2);
        assert_eq!(output(reporter), "a:\t30s (no change)\nb:\t30s (no change)\n");
    }

    #[test]
    fn set_timeout_reports_and_writes_differences() {
        let mut client = FakeClient::default()
            .with(Collection::VirtualServers, "a", json!({"connection": {"timeout": 300, "keepalive": true}}))
            .with(Collection::VirtualServers, "b", json!({"connection": {"timeout": 30}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: CONNECTION_TIMEOUT,
            desired: 30,
        };

        ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("*").unwrap(), &mut reporter)
            .unwrap();

        assert_eq!(output(reporter), "a:\t300s -> 30s\nb:\t30s (no change)\n");
        assert_eq!(client.writes.len(), 1);
        assert_eq!(
            client.writes[0].to_document(),
            json!({"properties": {"connection": {"timeout": 30, "keepalive": true}}})
        );
    }

    #[test]
    fn dry_run_reports_without_writing() {
        let mut client = FakeClient::default()
            .with(Collection::Pools, "pool-1", json!({"connection": {"max_reply_time": 45}}))
            .with(Collection::Pools, "pool-10", json!({"connection": {"max_reply_time": 45}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: MAX_REPLY_TIME,
            desired: 60,
        };

        let summary = ChangeEngine::new(&mut client, true, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("pool-1").unwrap(), &mut reporter)
            .unwrap();

        assert_eq!(output(reporter), "pool-1:\t45s -> 60s\n");
        assert_eq!(summary.would_change, 1);
        assert!(client.writes.is_empty());
    }

    #[test]
    fn abort_policy_stops_at_first_failed_write() {
        let mut client = FakeClient::default()
            .with(Collection::Pools, "p1", json!({"connection": {"max_reply_time": 1}}))
            .with(Collection::Pools, "p2", json!({"connection": {"max_reply_time": 1}}))
            .with(Collection::Pools, "p3", json!({"connection": {"max_reply_time": 1}}));
        client.fail_writes_for.push("p2".into());
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: MAX_REPLY_TIME,
            desired: 5,
        };

        let err = ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("*").unwrap(), &mut reporter)
            .unwrap_err();

        assert!(matches!(err, EngineError::Remote(RemoteError::Status { status: 500, .. })));
        assert_eq!(output(reporter), "p1:\t1s -> 5s\np2:\t1s -> 5s\n");
        // p1 stays written, p3 is never reached.
        assert_eq!(client.writes.len(), 1);
        assert_eq!(client.writes[0].name, "p1");
    }

    #[test]
    fn continue_policy_processes_everything_then_fails() {
        let mut client = FakeClient::default()
            .with(Collection::Pools, "p1", json!({"connection": {"max_reply_time": 1}}))
            .with(Collection::Pools, "p2", json!({"connection": {"max_reply_time": 1}}))
            .with(Collection::Pools, "p3", json!({"connection": {"max_reply_time": 1}}));
        client.fail_writes_for.push("p2".into());
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: MAX_REPLY_TIME,
            desired: 5,
        };

        let err = ChangeEngine::new(&mut client, false, FailurePolicy::Continue)
            .run(&change, &Matcher::compile("*").unwrap(), &mut reporter)
            .unwrap_err();

        assert!(matches!(
            err,
            EngineError::Incomplete {
                failed: 1,
                attempted: 3
            }
        ));
        assert_eq!(client.writes.len(), 2);
        assert_eq!(output(reporter).lines().count(), 3);
    }

    #[test]
    fn missing_field_is_fatal() {
        let mut client = FakeClient::default()
            .with(Collection::VirtualServers, "bare", json!({"basic": {}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: CONNECTION_TIMEOUT,
            desired: 10,
        };

        let err = ChangeEngine::new(&mut client, false, FailurePolicy::Continue)
            .run(&change, &Matcher::compile("*").unwrap(), &mut reporter)
            .unwrap_err();
        assert!(matches!(err, EngineError::Remote(RemoteError::Field(_))));
    }

    #[test]
    fn no_match_is_not_an_error() {
        let mut client = FakeClient::default()
            .with(Collection::Pools, "p1", json!({"connection": {"max_reply_time": 1}}));
        let mut reporter = Reporter::new(Vec::new());
        let change = ScalarChange {
            field: MAX_REPLY_TIME,
            desired: 5,
        };

        let summary = ChangeEngine::new(&mut client, false, FailurePolicy::Abort)
            .run(&change, &Matcher::compile("nothing-*").unwrap(), &mut reporter)
            .unwrap();
        assert_eq!(summary.processed(), 0);
        assert!(output(reporter).is_empty());
    }

    #[test]
    fn reads_scalars_and_rule_states_in_listing_order() {
        let mut client = FakeClient::default()
            .with(
                Collection::VirtualServers,
                "web",
                json!({"basic": {"request_rules": ["/block-tor", "geo-eu", "log"]}, "connection": {"timeout": 40}}),
            )
            .with(
                Collection::VirtualServers,
                "api",
                json!({"basic": {"request_rules": ["log"]}, "connection": {"timeout": 300}}),
            );
        let mut engine = ChangeEngine::new(&mut client, false, FailurePolicy::Abort);
        let all = Matcher::compile("*").unwrap();

        let timeouts = engine.read_scalar(&CONNECTION_TIMEOUT, &all).unwrap();
        assert_eq!(timeouts, vec![("web".to_string(), 40), ("api".to_string(), 300)]);

        let states = engine
            .rule_states(&all, &Matcher::compile("*-*").unwrap())
            .unwrap();
        assert_eq!(
            states,
            vec![
                RuleListing {
                    name: "web".into(),
                    rules: vec![
                        ("block-tor".into(), RuleState::Disabled),
                        ("geo-eu".into(), RuleState::Enabled),
                    ],
                },
                RuleListing {
                    name: "api".into(),
                    rules: vec![],
                },
            ]
        );
    }
}
