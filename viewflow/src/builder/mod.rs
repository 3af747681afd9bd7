//! Turns a query plan into an operator graph.
//!
//! Construction runs leaf to root: connect the source (with ordering
//! completed to cover the primary key, the subquery-free filter residue
//! pushed down, and the computed split-edit keys), wrap a Skip for the
//! start cursor, attach one limited child join per EXISTS sub-condition,
//! apply the WHERE clause as a filter sub-pipeline (fanning out
//! subquery-bearing disjuncts), apply the limit as a partition-aware Take,
//! and finally recurse into the result subqueries, attaching each with a
//! Join. Flip-marked EXISTS conditions bypass the filter pipeline: their
//! disjunction is rebuilt as UnionFanOut/UnionFanIn around flipped inner
//! joins.

use std::collections::BTreeSet;
use std::rc::Rc;

use tracing::debug;

use crate::ast::{Ast, Condition, ExistsCondition, ExistsOp};
use crate::error::{BuildError, PlannerError, UnsupportedFeatureError};
use crate::input::Input;
use crate::operators::exists::Exists;
use crate::operators::fan::{FanIn, FanOut};
use crate::operators::filter::{Filter, FilterEnd, FilterPipeline, FilterStage};
use crate::operators::flipped_join::FlippedJoin;
use crate::operators::join::Join;
use crate::operators::skip::Skip;
use crate::operators::take::Take;
use crate::operators::union::{UnionFanIn, UnionFanOut};
use crate::schema::{SchemaRef, System};
use crate::source::Source;
use crate::storage::Storage;

/// The environment a build runs in: sources, scratch storage, and the
/// tracing/debug hooks. Decoration hooks may wrap inputs without changing
/// semantics.
pub trait BuilderDelegate {
    fn get_source(&self, table: &str) -> Option<Rc<Source>>;

    fn create_storage(&self, name: &str) -> Rc<dyn Storage>;

    fn decorate_input(&self, input: Rc<dyn Input>, _name: &str) -> Rc<dyn Input> {
        input
    }

    fn decorate_filter_input(&self, input: Rc<dyn Input>, _name: &str) -> Rc<dyn Input> {
        input
    }

    fn decorate_source_input(&self, input: Rc<dyn Input>, _name: &str) -> Rc<dyn Input> {
        input
    }

    /// Graph-topology registration for the debugger.
    fn add_edge(&self, _source: &str, _dest: &str) {}

    /// Remaps wire names to local names before building.
    fn map_ast(&self, ast: Ast) -> Ast {
        ast
    }

    /// NOT EXISTS is rejected unless the delegate opts in (server only).
    fn enable_not_exists(&self) -> bool {
        false
    }

    /// Re-apply filter conditions even when the source enforced them.
    fn apply_filters_anyway(&self) -> bool {
        false
    }

    fn max_flippable_joins(&self) -> usize {
        3
    }

    fn debug(&self) -> bool {
        false
    }
}

pub struct BuiltQuery {
    pub root: Rc<dyn Input>,
}

impl std::fmt::Debug for BuiltQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltQuery").finish_non_exhaustive()
    }
}

impl BuiltQuery {
    pub fn schema(&self) -> SchemaRef {
        self.root.schema()
    }

    pub fn destroy(&self) {
        self.root.destroy();
    }
}

/// Builds the operator graph for `ast`.
pub fn build_query(ast: &Ast, delegate: &dyn BuilderDelegate) -> Result<BuiltQuery, BuildError> {
    let ast = delegate.map_ast(ast.clone());
    let mut builder = Builder {
        delegate,
        alias_counter: 0,
        storage_counter: 0,
        flip_count: 0,
    };
    let root = builder.build_node(&ast, &[], None)?;
    debug!(table = %ast.table, "built query graph");
    Ok(BuiltQuery { root })
}

/// Walks `where` and rejects NOT EXISTS at any depth.
pub fn assert_no_not_exists(condition: &Condition) -> Result<(), UnsupportedFeatureError> {
    if condition.contains_not_exists() {
        Err(UnsupportedFeatureError::NotExistsOnClient)
    } else {
        Ok(())
    }
}

/// A where-clause condition with its subqueries resolved into relationship
/// names, ready to become filter stages.
enum CompiledCond {
    Simple(Condition),
    Exists {
        relationship: Box<str>,
        op: ExistsOp,
        parent_key: Vec<Box<str>>,
    },
    And(Vec<CompiledCond>),
    Or(Vec<CompiledCond>),
}

struct Builder<'a> {
    delegate: &'a dyn BuilderDelegate,
    alias_counter: usize,
    storage_counter: usize,
    flip_count: usize,
}

impl<'a> Builder<'a> {
    fn build_node(
        &mut self,
        ast: &Ast,
        extra_split_keys: &[Box<str>],
        partition_key: Option<Vec<Box<str>>>,
    ) -> Result<Rc<dyn Input>, BuildError> {
        let source = self
            .delegate
            .get_source(&ast.table)
            .ok_or_else(|| BuildError::UnknownTable(ast.table.to_string()))?;
        let schema = source.schema();

        if let Some(where_clause) = &ast.where_clause {
            if !self.delegate.enable_not_exists() {
                assert_no_not_exists(where_clause)?;
            }
        }

        let ordering = ast
            .order_by
            .clone()
            .unwrap_or_else(|| schema.sort.clone())
            .complete(&schema.primary_key);

        let mut split_edit_keys: BTreeSet<Box<str>> =
            extra_split_keys.iter().cloned().collect();
        for related in &ast.related {
            split_edit_keys.extend(related.correlation.parent_field.iter().cloned());
        }
        if let Some(where_clause) = &ast.where_clause {
            collect_exists_parent_keys(where_clause, &mut split_edit_keys);
        }

        let (source_filter, fully_applied) = match &ast.where_clause {
            None => (None, true),
            Some(where_clause) => where_clause.source_filter(),
        };

        let connection = source.connect(ordering, source_filter, split_edit_keys)?;
        let applied_at_source =
            connection.fully_applied_filters() && !self.delegate.apply_filters_anyway();
        let source_name = format!("{}.source", ast.table);
        let mut current: Rc<dyn Input> = self
            .delegate
            .decorate_source_input(connection, &source_name);
        let mut current_name = source_name;

        if let Some(bound) = &ast.start {
            let skip = Skip::connect(current, bound.clone());
            current = self.decorate(skip, &ast.table, "skip", &mut current_name);
        }

        if let Some(where_clause) = &ast.where_clause {
            if !(fully_applied && applied_at_source) {
                current = self.apply_where(
                    current,
                    &mut current_name,
                    ast,
                    where_clause,
                    applied_at_source,
                )?;
            }
        }

        if let Some(limit) = ast.limit {
            let storage = self.create_take_storage(&ast.table);
            let take = Take::connect(current, storage, limit, partition_key);
            current = self.decorate(take, &ast.table, "take", &mut current_name);
        }

        for related in &ast.related {
            let correlation = &related.correlation;
            let child = self.build_node(
                &related.subquery,
                &correlation.child_field,
                Some(correlation.child_field.clone()),
            )?;
            let name = related
                .subquery
                .alias
                .clone()
                .unwrap_or_else(|| related.subquery.table.clone());
            let join = Join::connect(
                current,
                child,
                &name,
                correlation.parent_field.clone(),
                correlation.child_field.clone(),
            );
            current = self.decorate(join, &ast.table, &format!("join({name})"), &mut current_name);
        }

        Ok(current)
    }

    fn decorate(
        &self,
        input: Rc<dyn Input>,
        table: &str,
        kind: &str,
        current_name: &mut String,
    ) -> Rc<dyn Input> {
        let name = format!("{table}.{kind}");
        self.delegate.add_edge(current_name, &name);
        *current_name = name.clone();
        self.delegate.decorate_input(input, &name)
    }

    fn create_take_storage(&mut self, table: &str) -> Rc<dyn Storage> {
        self.storage_counter += 1;
        self.delegate
            .create_storage(&format!("{table}.take.{}", self.storage_counter))
    }

    fn uniquify(&mut self, base: &str) -> String {
        self.alias_counter += 1;
        format!("{base}_{}", self.alias_counter)
    }

    /// Applies a where clause over `current`. Flip-free conditions become a
    /// filter sub-pipeline; flip-containing disjunctions are rebuilt around
    /// union fan-out/fan-in with flipped inner joins.
    fn apply_where(
        &mut self,
        current: Rc<dyn Input>,
        current_name: &mut String,
        ast: &Ast,
        condition: &Condition,
        applied_at_source: bool,
    ) -> Result<Rc<dyn Input>, BuildError> {
        if !condition.contains_flip() {
            return self.apply_filter_pipeline(
                current,
                current_name,
                ast,
                condition,
                applied_at_source,
            );
        }
        match condition {
            Condition::Exists(exists) if exists.flip => {
                self.apply_flipped(current, current_name, ast, exists)
            }
            Condition::And(conditions) => {
                let mut current = current;
                for condition in conditions {
                    current = self.apply_where(
                        current,
                        current_name,
                        ast,
                        condition,
                        applied_at_source,
                    )?;
                }
                Ok(current)
            }
            Condition::Or(branches) => {
                let fan_out = UnionFanOut::connect(current);
                let fan_out_name = format!("{}.union-fan-out", ast.table);
                self.delegate.add_edge(current_name, &fan_out_name);
                let mut branch_inputs = Vec::new();
                for (index, branch) in branches.iter().enumerate() {
                    let mut branch_name = format!("{fan_out_name}[{index}]");
                    let branch_input = self.apply_where(
                        fan_out.clone() as Rc<dyn Input>,
                        &mut branch_name,
                        ast,
                        branch,
                        // A disjunct inside a subquery-bearing OR was never
                        // pushed down to the source.
                        false,
                    )?;
                    branch_inputs.push(branch_input);
                }
                let fan_in = UnionFanIn::connect(&fan_out, branch_inputs);
                *current_name = format!("{}.union-fan-in", ast.table);
                Ok(self
                    .delegate
                    .decorate_input(fan_in, current_name))
            }
            // Flips live on EXISTS conditions; anything else cannot report
            // `contains_flip`.
            _ => unreachable!("flip outside an exists/or/and condition"),
        }
    }

    /// Replaces a flip-marked EXISTS with a child-driven inner join.
    fn apply_flipped(
        &mut self,
        current: Rc<dyn Input>,
        current_name: &mut String,
        ast: &Ast,
        exists: &ExistsCondition,
    ) -> Result<Rc<dyn Input>, BuildError> {
        assert!(
            exists.op == ExistsOp::Exists,
            "the planner cannot flip a NOT EXISTS condition"
        );
        self.flip_count += 1;
        let max = self.delegate.max_flippable_joins();
        if self.flip_count > max {
            return Err(PlannerError::MaxFlippableJoins {
                required: self.flip_count,
                max,
            }
            .into());
        }

        let correlation = &exists.related.correlation;
        let child = self.build_node(
            &exists.related.subquery,
            &correlation.child_field,
            Some(correlation.child_field.clone()),
        )?;
        let base = exists
            .related
            .subquery
            .alias
            .as_deref()
            .unwrap_or(&exists.related.subquery.table);
        let relationship = self.uniquify(base);
        let flipped = FlippedJoin::connect(
            current,
            child,
            &relationship,
            correlation.parent_field.clone(),
            correlation.child_field.clone(),
        );
        Ok(self.decorate(
            flipped,
            &ast.table,
            &format!("flipped-join({relationship})"),
            current_name,
        ))
    }

    /// Builds the filter sub-pipeline for a flip-free condition: attach one
    /// limited child join per EXISTS sub-condition, then chain the stages.
    fn apply_filter_pipeline(
        &mut self,
        current: Rc<dyn Input>,
        current_name: &mut String,
        ast: &Ast,
        condition: &Condition,
        applied_at_source: bool,
    ) -> Result<Rc<dyn Input>, BuildError> {
        let mut current = current;
        let compiled = self.compile_cond(
            condition,
            &mut current,
            current_name,
            ast,
            applied_at_source,
        )?;
        let Some(compiled) = compiled else {
            return Ok(current);
        };

        let schema = current.schema();
        let end = FilterEnd::new();
        let first = self.build_stage(&compiled, end.clone() as Rc<dyn FilterStage>, &schema);
        let pipeline = FilterPipeline::connect(current, first, end);
        let name = format!("{}.filter", ast.table);
        self.delegate.add_edge(current_name, &name);
        *current_name = name.clone();
        Ok(self.delegate.decorate_filter_input(pipeline, &name))
    }

    /// Resolves subqueries into relationships (attaching their joins below
    /// the pipeline) and prunes fragments the source already enforces.
    fn compile_cond(
        &mut self,
        condition: &Condition,
        current: &mut Rc<dyn Input>,
        current_name: &mut String,
        ast: &Ast,
        applied_at_source: bool,
    ) -> Result<Option<CompiledCond>, BuildError> {
        match condition {
            Condition::Compare { .. } => {
                if applied_at_source {
                    Ok(None)
                } else {
                    Ok(Some(CompiledCond::Simple(condition.clone())))
                }
            }
            Condition::And(conditions) => {
                let mut compiled = Vec::new();
                for condition in conditions {
                    if let Some(c) = self.compile_cond(
                        condition,
                        current,
                        current_name,
                        ast,
                        applied_at_source,
                    )? {
                        compiled.push(c);
                    }
                }
                match compiled.len() {
                    0 => Ok(None),
                    1 => Ok(compiled.pop()),
                    _ => Ok(Some(CompiledCond::And(compiled))),
                }
            }
            Condition::Or(branches) => {
                if !condition.contains_subquery() {
                    // All-simple disjunctions were pushed down whole.
                    if applied_at_source {
                        return Ok(None);
                    }
                    return Ok(Some(CompiledCond::Simple(condition.clone())));
                }
                let mut compiled = Vec::new();
                for branch in branches {
                    // Disjuncts were not pushed down; compile them whole.
                    if let Some(c) =
                        self.compile_cond(branch, current, current_name, ast, false)?
                    {
                        compiled.push(c);
                    }
                }
                Ok(Some(CompiledCond::Or(compiled)))
            }
            Condition::Exists(exists) => {
                let relationship =
                    self.attach_exists_join(exists, current, current_name, ast)?;
                Ok(Some(CompiledCond::Exists {
                    relationship: Box::from(relationship.as_str()),
                    op: exists.op,
                    parent_key: exists.related.correlation.parent_field.clone(),
                }))
            }
        }
    }

    /// The child-side pipeline of an EXISTS condition: the subquery graph
    /// under a limit of 3 (1 for permission sources), joined on below the
    /// filter pipeline and gated by a downstream Exists stage.
    fn attach_exists_join(
        &mut self,
        exists: &ExistsCondition,
        current: &mut Rc<dyn Input>,
        current_name: &mut String,
        ast: &Ast,
    ) -> Result<String, BuildError> {
        let correlation = &exists.related.correlation;
        let child = self.build_node(
            &exists.related.subquery,
            &correlation.child_field,
            Some(correlation.child_field.clone()),
        )?;

        let child_system = child.schema().system;
        let limit = exists_child_limit(child_system);
        let storage = self.create_take_storage(&exists.related.subquery.table);
        let limited = Take::connect(
            child,
            storage,
            limit,
            Some(correlation.child_field.clone()),
        );

        let base = exists
            .related
            .subquery
            .alias
            .as_deref()
            .unwrap_or(&exists.related.subquery.table);
        let relationship = self.uniquify(base);
        let join = Join::connect(
            current.clone(),
            limited,
            &relationship,
            correlation.parent_field.clone(),
            correlation.child_field.clone(),
        );
        *current = self.decorate(
            join,
            &ast.table,
            &format!("exists-join({relationship})"),
            current_name,
        );
        Ok(relationship)
    }

    /// Chains stages end-to-start so each stage owns its successor.
    fn build_stage(
        &mut self,
        compiled: &CompiledCond,
        next: Rc<dyn FilterStage>,
        schema: &SchemaRef,
    ) -> Rc<dyn FilterStage> {
        match compiled {
            CompiledCond::Simple(condition) => Filter::new(condition.clone(), next),
            CompiledCond::Exists {
                relationship,
                op,
                parent_key,
            } => Exists::new(
                relationship,
                *op,
                parent_key.clone(),
                schema.clone(),
                next,
            ),
            CompiledCond::And(conditions) => {
                let mut next = next;
                for condition in conditions.iter().rev() {
                    next = self.build_stage(condition, next, schema);
                }
                next
            }
            CompiledCond::Or(branches) => {
                // Subquery-bearing branches fan out; the simple residue
                // collapses into a single disjunctive filter branch.
                let mut simple = Vec::new();
                let mut fanned = Vec::new();
                for branch in branches {
                    match branch {
                        CompiledCond::Simple(condition) => simple.push(condition.clone()),
                        other => fanned.push(other),
                    }
                }
                if fanned.is_empty() {
                    return Filter::new(Condition::Or(simple), next);
                }
                let fan_in = FanIn::new(schema.clone(), next);
                let mut branch_stages: Vec<Rc<dyn FilterStage>> = Vec::new();
                for branch in fanned {
                    branch_stages
                        .push(self.build_stage(branch, fan_in.clone() as Rc<dyn FilterStage>, schema));
                }
                if !simple.is_empty() {
                    branch_stages.push(Filter::new(
                        Condition::Or(simple),
                        fan_in.clone() as Rc<dyn FilterStage>,
                    ));
                }
                let schemas = vec![schema.clone(); branch_stages.len()];
                FanOut::new(fan_in, branch_stages, schemas) as Rc<dyn FilterStage>
            }
        }
    }
}

fn exists_child_limit(system: System) -> usize {
    match system {
        System::Permissions => 1,
        System::Client | System::Server => 3,
    }
}

fn collect_exists_parent_keys(condition: &Condition, keys: &mut BTreeSet<Box<str>>) {
    match condition {
        Condition::Compare { .. } => {}
        Condition::And(cs) | Condition::Or(cs) => {
            for c in cs {
                collect_exists_parent_keys(c, keys);
            }
        }
        Condition::Exists(exists) => {
            keys.extend(exists.related.correlation.parent_field.iter().cloned());
        }
    }
}
