//! Action executor: the total function from `ActionIntent` to
//! `ActionResult`.
//!
//! Pipeline for every action: pre-validate, permission check through the
//! contract engine, resource pre-check, then an atomic apply that mutates
//! state and emits events. No exception escapes: every failure becomes a
//! structured result with a stable error code, and a system-category
//! failure triggers an invariant sweep.
//!
//! Invoked code runs *as the caller* — nested actions re-enter the executor
//! under the caller's principal, so every charge bills the caller.

use indexmap::IndexMap;

use crate::action::{ActionIntent, ActionResult};
use crate::artifact::{
    reserved_owner, Artifact, CreateSpec, WritePatch, FORBIDDEN_METADATA_KEYS,
};
use crate::contract::{self, AccessKind, Decision};
use crate::error::{KernelError, KernelResult};
use crate::events::EventKind;
use crate::kernel::{
    Kernel, KernelActions, KernelState, MAX_INVOKE_DEPTH, FUEL_PER_SCRIP, RES_DISK_BYTES,
};
use crate::lang::{self, EvalBudget, EvalError, LangHost, Value};
use crate::mint::MINT_PRINCIPAL;
use crate::types::KERNEL_PRINCIPAL;

/// Budget for executable contract checks.
const CONTRACT_BUDGET: EvalBudget = EvalBudget {
    max_fuel: 50_000,
    deadline_ms: 100,
};

/// Ceiling on invoke fuel; the effective budget is further capped by the
/// caller's scrip so the metered cost is always collectable.
const INVOKE_MAX_FUEL: u64 = 500_000;
const INVOKE_DEADLINE_MS: u64 = 1_000;

/// What a handler returns on success.
pub(crate) struct ExecOutcome {
    data: Option<serde_json::Value>,
    message: String,
    consumed: IndexMap<String, u64>,
}

impl ExecOutcome {
    fn new(data: Option<serde_json::Value>, message: impl Into<String>) -> Self {
        Self {
            data,
            message: message.into(),
            consumed: IndexMap::new(),
        }
    }

    fn charge(mut self, resource: &str, amount: u64) -> Self {
        if amount > 0 {
            *self.consumed.entry(resource.to_string()).or_insert(0) += amount;
        }
        self
    }
}

impl Kernel {
    /// Execute one action. Total: always returns a result, never panics on
    /// agent input. Also the checkpoint tick.
    pub fn execute(&mut self, intent: ActionIntent) -> ActionResult {
        let result = self.execute_at_depth(intent, 0);
        if let Err(e) = self.maybe_checkpoint() {
            log::error!("checkpoint failed: {}", e);
        }
        result
    }

    pub(crate) fn execute_at_depth(&mut self, intent: ActionIntent, depth: usize) -> ActionResult {
        let principal = intent.principal_id().to_string();
        let action = intent.kind_name();
        let target = intent.target().map(str::to_string);

        let checked = self.pre_validate(&principal).and_then(|_| {
            self.dispatch(intent, depth)
        });
        match checked {
            Ok(outcome) => ActionResult::success(outcome.data, outcome.message, outcome.consumed),
            Err(err) => {
                self.note_denial(&principal, action, target.as_deref(), &err);
                if let KernelError::System(_) = &err {
                    if let Err(violation) = self.validate_invariants() {
                        // Unrecoverable: the journal records the violation,
                        // then the process dies. Restore is the only way
                        // back.
                        log::error!("invariant violated after system error: {}", violation);
                        panic!("kernel invariant violated: {}", violation);
                    }
                }
                ActionResult::failure(&err)
            }
        }
    }

    fn pre_validate(&self, principal: &str) -> KernelResult<()> {
        if principal == KERNEL_PRINCIPAL {
            return Err(KernelError::Validation(
                "the kernel principal is not actionable".into(),
            ));
        }
        if !self.is_principal(principal) {
            return Err(KernelError::NotFound(format!("principal {}", principal)));
        }
        Ok(())
    }

    fn dispatch(&mut self, intent: ActionIntent, depth: usize) -> KernelResult<ExecOutcome> {
        match intent {
            ActionIntent::Noop { principal_id } => {
                self.note_executed(&principal_id, "noop", None, None)?;
                Ok(ExecOutcome::new(None, "noop"))
            }
            ActionIntent::Read {
                principal_id,
                artifact_id,
            } => self.handle_read(&principal_id, &artifact_id),
            ActionIntent::Write {
                principal_id,
                artifact_id,
                content,
                code,
                metadata,
                access_contract_id,
                artifact_type,
                created_by,
            } => self.handle_write(
                &principal_id,
                &artifact_id,
                content,
                code,
                metadata,
                access_contract_id,
                artifact_type,
                created_by,
            ),
            ActionIntent::Edit {
                principal_id,
                artifact_id,
                old_string,
                new_string,
            } => self.handle_edit(&principal_id, &artifact_id, &old_string, &new_string),
            ActionIntent::Invoke {
                principal_id,
                artifact_id,
                method,
                args,
            } => self.handle_invoke(&principal_id, &artifact_id, method, args, depth),
            ActionIntent::Delete {
                principal_id,
                artifact_id,
            } => self.handle_delete(&principal_id, &artifact_id),
            ActionIntent::QueryKernel {
                principal_id,
                query,
                params,
            } => self.handle_query(&principal_id, &query, params),
            ActionIntent::Subscribe {
                principal_id,
                artifact_id,
            } => self.handle_subscription(&principal_id, &artifact_id, true),
            ActionIntent::Unsubscribe {
                principal_id,
                artifact_id,
            } => self.handle_subscription(&principal_id, &artifact_id, false),
            ActionIntent::ConfigureContext {
                principal_id,
                context,
            } => self.handle_agent_field(
                &principal_id,
                "configure_context",
                "context",
                serde_json::Value::Object(context),
            ),
            ActionIntent::ModifySystemPrompt {
                principal_id,
                system_prompt,
            } => self.handle_agent_field(
                &principal_id,
                "modify_system_prompt",
                "system_prompt",
                serde_json::Value::String(system_prompt),
            ),
        }
    }

    // ------------------------------------------------------------------
    // Permission
    // ------------------------------------------------------------------

    /// Full contract dispatch for `(caller, access, target)`. Kernel
    /// overrides run first; denial is an error, success carries the
    /// contract's cost.
    pub(crate) fn check_permission(
        &mut self,
        caller: &str,
        access: AccessKind,
        target_id: &str,
    ) -> KernelResult<Decision> {
        let target = self
            .store
            .get(target_id)
            .ok_or_else(|| KernelError::NotFound(format!("artifact {}", target_id)))?
            .clone();
        if target.kernel_protected
            && matches!(access, AccessKind::Write | AccessKind::Edit | AccessKind::Delete)
        {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: target_id.to_string(),
                reason: "kernel_protected".into(),
            });
        }

        let contract_id = target
            .access_contract_id
            .clone()
            .unwrap_or_else(|| contract::GENESIS_CONTRACT_FREEWARE.to_string());
        let decision = match contract::genesis_decision(&contract_id, caller, access, &target) {
            Some(decision) => decision,
            None => self.check_executable_contract(&contract_id, caller, access, &target)?,
        };
        if !decision.allowed {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: target_id.to_string(),
                reason: decision
                    .reason
                    .unwrap_or_else(|| format!("denied by {}", contract_id)),
            });
        }
        Ok(decision)
    }

    fn check_executable_contract(
        &mut self,
        contract_id: &str,
        caller: &str,
        access: AccessKind,
        target: &Artifact,
    ) -> KernelResult<Decision> {
        let evaluated = match self.store.get(contract_id) {
            None => Err(format!("access contract {} not found", contract_id)),
            Some(contract_artifact) if contract_artifact.artifact_type != "contract" => Err(
                format!("{} is not a contract artifact", contract_id),
            ),
            Some(contract_artifact) => {
                let code = contract_artifact
                    .code
                    .clone()
                    .unwrap_or_else(|| contract_artifact.content.clone());
                let mut host = StateHost { kernel: self };
                contract::evaluate_executable(
                    &code,
                    caller,
                    access,
                    target,
                    &mut host,
                    CONTRACT_BUDGET,
                )
            }
        };
        match evaluated {
            Ok(decision) => Ok(decision),
            Err(reason) => {
                self.emit(
                    EventKind::ContractFault,
                    serde_json::json!({
                        "contract": contract_id,
                        "caller": caller,
                        "target": target.id,
                        "action": access.as_str(),
                        "reason": reason,
                    }),
                )?;
                Err(KernelError::ContractFault {
                    contract: contract_id.to_string(),
                    reason,
                })
            }
        }
    }

    /// Charge a contract's scrip cost to the caller, paid to the target's
    /// creator. Callers pre-check affordability before any event.
    fn charge_access_cost(
        &mut self,
        caller: &str,
        beneficiary: &str,
        cost: u64,
    ) -> KernelResult<()> {
        if cost == 0 || caller == beneficiary {
            return Ok(());
        }
        self.transfer_scrip(caller, beneficiary, cost, "access_cost")
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn handle_read(&mut self, caller: &str, artifact_id: &str) -> KernelResult<ExecOutcome> {
        let decision = self.check_permission(caller, AccessKind::Read, artifact_id)?;
        self.require_scrip(caller, decision.cost)?;
        self.note_executed(caller, "read", Some(artifact_id), None)?;
        let beneficiary = self.store.get_required(artifact_id)?.created_by.clone();
        self.charge_access_cost(caller, &beneficiary, decision.cost)?;
        let artifact = self.store.get_required(artifact_id)?;
        let data = read_projection(artifact);
        Ok(ExecOutcome::new(Some(data), format!("read {}", artifact_id))
            .charge("scrip", decision.cost))
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_write(
        &mut self,
        caller: &str,
        artifact_id: &str,
        content: Option<String>,
        code: Option<String>,
        metadata: Option<IndexMap<String, serde_json::Value>>,
        access_contract_id: Option<String>,
        artifact_type: Option<String>,
        created_by: Option<String>,
    ) -> KernelResult<ExecOutcome> {
        if let Some(metadata) = &metadata {
            for key in FORBIDDEN_METADATA_KEYS {
                if metadata.contains_key(*key) {
                    return Err(KernelError::Validation(format!(
                        "{} is a system field, not metadata",
                        key
                    )));
                }
            }
        }
        if self.store.contains(artifact_id) {
            self.write_existing(
                caller,
                artifact_id,
                content,
                code,
                metadata,
                access_contract_id,
                artifact_type,
                created_by,
            )
        } else {
            self.write_create(
                caller,
                artifact_id,
                content,
                code,
                metadata,
                access_contract_id,
                artifact_type,
                created_by,
            )
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn write_existing(
        &mut self,
        caller: &str,
        artifact_id: &str,
        content: Option<String>,
        code: Option<String>,
        metadata: Option<IndexMap<String, serde_json::Value>>,
        access_contract_id: Option<String>,
        artifact_type: Option<String>,
        created_by: Option<String>,
    ) -> KernelResult<ExecOutcome> {
        let current = self.store.get_required(artifact_id)?.clone();
        if let Some(t) = &artifact_type {
            if *t != current.artifact_type {
                return Err(KernelError::ImmutableField {
                    artifact: artifact_id.to_string(),
                    field: "type",
                });
            }
        }
        if let Some(cb) = &created_by {
            if *cb != current.created_by {
                return Err(KernelError::ImmutableField {
                    artifact: artifact_id.to_string(),
                    field: "created_by",
                });
            }
        }
        let decision = self.check_permission(caller, AccessKind::Write, artifact_id)?;
        if access_contract_id.is_some() && caller != current.created_by {
            return Err(KernelError::Permission {
                principal: caller.to_string(),
                artifact: artifact_id.to_string(),
                reason: "only the creator may change access_contract_id".into(),
            });
        }

        // Disk accounting: the artifact's footprint is attributed to its
        // creator; the size delta settles against the creator's quota.
        let new_len = content.as_deref().map_or(current.content.len(), str::len)
            + code
                .as_deref()
                .map_or(current.code.as_deref().map_or(0, str::len), str::len);
        let old_len = current.disk_footprint() as usize;
        let grow = new_len.saturating_sub(old_len) as u64;
        let shrink = old_len.saturating_sub(new_len) as u64;
        let now_ms = self.now_ms();
        if grow > 0
            && !self
                .resources
                .can_consume(&current.created_by, RES_DISK_BYTES, grow, now_ms)?
        {
            let available = self.resources.balance(&current.created_by, RES_DISK_BYTES, now_ms)?;
            return Err(KernelError::ResourceExhausted {
                principal: current.created_by.clone(),
                resource: RES_DISK_BYTES.into(),
                needed: grow,
                available,
            });
        }
        self.require_scrip(caller, decision.cost)?;

        self.note_executed(caller, "write", Some(artifact_id), None)?;
        let event_number = self.journal.next_number();
        let updated = self.store.write(
            artifact_id,
            WritePatch {
                content,
                code,
                metadata,
                access_contract_id,
            },
            caller,
            false,
            event_number,
        )?;
        if grow > 0 {
            self.resources
                .consume(&current.created_by, RES_DISK_BYTES, grow, now_ms)?;
            self.emit(
                EventKind::ResourceConsumed,
                serde_json::json!({
                    "principal": current.created_by, "resource": RES_DISK_BYTES,
                    "amount": grow, "at_ms": now_ms,
                }),
            )?;
        } else if shrink > 0 {
            self.resources
                .refund(&current.created_by, RES_DISK_BYTES, shrink, now_ms)?;
            self.emit(
                EventKind::ResourceRefunded,
                serde_json::json!({
                    "principal": current.created_by, "resource": RES_DISK_BYTES,
                    "amount": shrink, "at_ms": now_ms,
                }),
            )?;
        }
        self.charge_access_cost(caller, &current.created_by, decision.cost)?;
        self.emit(
            EventKind::ArtifactWritten,
            serde_json::json!({ "artifact": updated }),
        )?;
        Ok(
            ExecOutcome::new(None, format!("wrote {}", artifact_id))
                .charge("scrip", decision.cost)
                .charge(RES_DISK_BYTES, grow),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn write_create(
        &mut self,
        caller: &str,
        artifact_id: &str,
        content: Option<String>,
        code: Option<String>,
        metadata: Option<IndexMap<String, serde_json::Value>>,
        access_contract_id: Option<String>,
        artifact_type: Option<String>,
        created_by: Option<String>,
    ) -> KernelResult<ExecOutcome> {
        let Some(artifact_type) = artifact_type else {
            return Err(KernelError::Validation(format!(
                "creating {} requires a type",
                artifact_id
            )));
        };
        if created_by.as_deref().is_some_and(|cb| cb != caller) {
            return Err(KernelError::Validation(
                "created_by is recorded by the kernel, not the intent".into(),
            ));
        }
        if let Some(owner) = reserved_owner(artifact_id) {
            if owner != caller {
                return Err(KernelError::ReservedId {
                    id: artifact_id.to_string(),
                    owner,
                });
            }
        }
        let footprint = (content.as_deref().map_or(0, str::len)
            + code.as_deref().map_or(0, str::len)) as u64;
        let now_ms = self.now_ms();
        if footprint > 0 && !self.resources.can_consume(caller, RES_DISK_BYTES, footprint, now_ms)? {
            let available = self.resources.balance(caller, RES_DISK_BYTES, now_ms)?;
            return Err(KernelError::ResourceExhausted {
                principal: caller.to_string(),
                resource: RES_DISK_BYTES.into(),
                needed: footprint,
                available,
            });
        }

        self.note_executed(caller, "write", Some(artifact_id), None)?;
        let event_number = self.journal.next_number();
        let created = self
            .store
            .create(
                CreateSpec {
                    id: artifact_id.to_string(),
                    artifact_type,
                    created_by: caller.to_string(),
                    content: content.unwrap_or_default(),
                    code,
                    access_contract_id,
                    kernel_protected: false,
                    metadata: metadata.unwrap_or_default(),
                },
                event_number,
                false,
            )?
            .clone();
        if footprint > 0 {
            self.resources
                .consume(caller, RES_DISK_BYTES, footprint, now_ms)?;
            self.emit(
                EventKind::ResourceConsumed,
                serde_json::json!({
                    "principal": caller, "resource": RES_DISK_BYTES,
                    "amount": footprint, "at_ms": now_ms,
                }),
            )?;
        }
        self.emit(
            EventKind::ArtifactCreated,
            serde_json::json!({ "artifact": created }),
        )?;
        Ok(
            ExecOutcome::new(
                Some(serde_json::json!({ "id": artifact_id })),
                format!("created {}", artifact_id),
            )
            .charge(RES_DISK_BYTES, footprint),
        )
    }

    fn handle_edit(
        &mut self,
        caller: &str,
        artifact_id: &str,
        old_string: &str,
        new_string: &str,
    ) -> KernelResult<ExecOutcome> {
        // Permission (and the kernel-protected override) wins over string
        // matching: an agent may not probe protected content via edit
        // errors.
        self.check_permission(caller, AccessKind::Edit, artifact_id)?;
        let current = self.store.get_required(artifact_id)?;
        let occurrences = current.content.matches(old_string).count();
        let new_content = match occurrences {
            0 => return Err(KernelError::OldStringNotFound(artifact_id.to_string())),
            1 => current.content.replacen(old_string, new_string, 1),
            _ => return Err(KernelError::OldStringNotUnique(artifact_id.to_string())),
        };
        // Delegates to write semantics for permission, cost, and events.
        self.write_existing(
            caller,
            artifact_id,
            Some(new_content),
            None,
            None,
            None,
            None,
            None,
        )
        .map(|outcome| ExecOutcome {
            message: format!("edited {}", artifact_id),
            ..outcome
        })
    }

    fn handle_delete(&mut self, caller: &str, artifact_id: &str) -> KernelResult<ExecOutcome> {
        let target = self.store.get_required(artifact_id)?.clone();
        if target.has_standing {
            let balance = self.ledger.balance(artifact_id).unwrap_or(0);
            if balance > 0 {
                return Err(KernelError::Validation(format!(
                    "{} holds {} scrip; principals are deleted only once empty",
                    artifact_id, balance
                )));
            }
        }
        let decision = self.check_permission(caller, AccessKind::Delete, artifact_id)?;
        self.require_scrip(caller, decision.cost)?;

        self.note_executed(caller, "delete", Some(artifact_id), None)?;
        let freed = target.disk_footprint();
        let now_ms = self.now_ms();
        if freed > 0 {
            self.resources
                .refund(&target.created_by, RES_DISK_BYTES, freed, now_ms)?;
            self.emit(
                EventKind::ResourceRefunded,
                serde_json::json!({
                    "principal": target.created_by, "resource": RES_DISK_BYTES,
                    "amount": freed, "at_ms": now_ms,
                }),
            )?;
        }
        self.store.delete(artifact_id, false)?;
        if target.has_standing {
            self.ledger.drop_row(artifact_id)?;
            self.resources.drop_principal(artifact_id);
            self.agents.shift_remove(artifact_id);
        }
        self.charge_access_cost(caller, &target.created_by, decision.cost)?;
        self.emit(
            EventKind::ArtifactDeleted,
            serde_json::json!({
                "artifact_id": artifact_id,
                "created_by": target.created_by,
                "freed_bytes": freed,
                "had_standing": target.has_standing,
            }),
        )?;
        Ok(ExecOutcome::new(None, format!("deleted {}", artifact_id))
            .charge("scrip", decision.cost))
    }

    fn handle_invoke(
        &mut self,
        caller: &str,
        artifact_id: &str,
        method: Option<String>,
        args: Option<serde_json::Value>,
        depth: usize,
    ) -> KernelResult<ExecOutcome> {
        if depth >= MAX_INVOKE_DEPTH {
            return Err(KernelError::Validation(format!(
                "invoke recursion deeper than {}",
                MAX_INVOKE_DEPTH
            )));
        }
        let decision = self.check_permission(caller, AccessKind::Invoke, artifact_id)?;
        let target = self.store.get_required(artifact_id)?.clone();
        let invoke_price = target
            .invoke_price()
            .map_err(KernelError::Validation)?;
        self.require_scrip(caller, decision.cost + invoke_price)?;

        self.note_executed(caller, "invoke", Some(artifact_id), method.as_deref())?;
        self.charge_access_cost(caller, &target.created_by, decision.cost)?;
        if invoke_price > 0 && caller != target.created_by {
            self.transfer_scrip(caller, &target.created_by, invoke_price, "invoke_price")?;
        }
        let base = ExecOutcome::new(None, String::new())
            .charge("scrip", decision.cost + invoke_price);

        if crate::genesis::is_genesis(artifact_id) {
            let data = crate::genesis::dispatch(
                self,
                caller,
                artifact_id,
                method.as_deref(),
                args.unwrap_or(serde_json::Value::Null),
            )?;
            return Ok(ExecOutcome {
                data: Some(data),
                message: format!(
                    "invoked {}.{}",
                    artifact_id,
                    method.as_deref().unwrap_or("default")
                ),
                ..base
            });
        }

        let Some(code) = target.code.clone() else {
            return Err(KernelError::Validation(format!(
                "artifact {} has no code to invoke",
                artifact_id
            )));
        };
        // Cap fuel by the caller's scrip so the metered interpreter cost is
        // always collectable afterwards.
        let remaining = self.ledger.balance(caller)?;
        let max_fuel = INVOKE_MAX_FUEL.min(remaining.saturating_mul(FUEL_PER_SCRIP).max(FUEL_PER_SCRIP));
        let method_value = method
            .as_deref()
            .map(|m| Value::Str(m.to_string()))
            .unwrap_or(Value::Nil);
        let args_value = args
            .as_ref()
            .map(lang::json_to_value)
            .unwrap_or(Value::Nil);
        let bindings = [
            ("caller", Value::Str(caller.to_string())),
            ("self-id", Value::Str(artifact_id.to_string())),
            ("method", method_value.clone()),
            ("args", args_value.clone()),
        ];
        let evaluated = {
            let mut host = ActionHost {
                kernel: self,
                caller: caller.to_string(),
                depth,
            };
            lang::eval_entry(
                &code,
                &bindings,
                Some(vec![method_value, args_value]),
                &mut host,
                EvalBudget {
                    max_fuel,
                    deadline_ms: INVOKE_DEADLINE_MS,
                },
            )
        };
        let outcome = match evaluated {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = e.to_string();
                self.emit(
                    EventKind::ContractFault,
                    serde_json::json!({
                        "artifact": artifact_id, "caller": caller,
                        "action": "invoke", "reason": reason,
                    }),
                )?;
                return Err(KernelError::ContractFault {
                    contract: artifact_id.to_string(),
                    reason,
                });
            }
        };
        let fuel_cost = outcome.fuel_used.div_ceil(FUEL_PER_SCRIP);
        if fuel_cost > 0 {
            self.transfer_scrip(caller, MINT_PRINCIPAL, fuel_cost, "interpreter_fuel")?;
        }
        let data = lang::value_to_json(&outcome.value).map_err(|e| {
            KernelError::ContractFault {
                contract: artifact_id.to_string(),
                reason: e.to_string(),
            }
        })?;
        Ok(ExecOutcome {
            data: Some(data),
            message: format!("invoked {}", artifact_id),
            ..base.charge("scrip", fuel_cost)
        })
    }

    fn handle_query(
        &mut self,
        caller: &str,
        query: &str,
        params: serde_json::Map<String, serde_json::Value>,
    ) -> KernelResult<ExecOutcome> {
        let str_param = |key: &str| params.get(key).and_then(|v| v.as_str());
        let data = match query {
            "balance" => {
                let principal = str_param("principal").unwrap_or(caller);
                serde_json::json!({
                    "principal": principal,
                    "balance": self.ledger.balance(principal)?,
                })
            }
            "artifacts" => {
                let hits: Vec<&Artifact> = match (str_param("type"), str_param("created_by")) {
                    (Some(t), _) => self.store.list_by_type(t),
                    (None, Some(creator)) => self.store.list_by_creator(creator),
                    (None, None) => self.store.iter().collect(),
                };
                serde_json::json!(hits
                    .iter()
                    .map(|a| {
                        serde_json::json!({
                            "id": a.id,
                            "type": a.artifact_type,
                            "created_by": a.created_by,
                        })
                    })
                    .collect::<Vec<_>>())
            }
            "mint_status" => self.mint_status(),
            "resources" => {
                let principal = str_param("principal").unwrap_or(caller).to_string();
                let now_ms = self.now_ms();
                let specs: Vec<String> = self
                    .resources
                    .registered()
                    .map(|s| s.id.clone())
                    .collect();
                let mut out = serde_json::Map::new();
                for resource in specs {
                    out.insert(
                        resource.clone(),
                        serde_json::json!(self.resources.balance(&principal, &resource, now_ms)?),
                    );
                }
                serde_json::Value::Object(out)
            }
            "time" => serde_json::json!({ "now_ms": self.now_ms() }),
            "events_recent" => {
                let n = params
                    .get("n")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(20)
                    .min(100) as usize;
                serde_json::json!(self.recent_events(n))
            }
            "invokers" => {
                let artifact_id = str_param("artifact_id").ok_or_else(|| {
                    KernelError::Validation("invokers query needs artifact_id".into())
                })?;
                serde_json::json!(self.invokers_of(artifact_id))
            }
            "charge_delegations" => {
                let payer = str_param("payer").unwrap_or(caller);
                self.charge_delegations(payer)?
            }
            // Trigger registration lives outside the kernel core; the
            // projection exists so callers need no schema change later.
            "triggers" => serde_json::json!([]),
            other => {
                return Err(KernelError::Validation(format!(
                    "unknown kernel query {}",
                    other
                )))
            }
        };
        self.note_executed(caller, "query_kernel", None, Some(query))?;
        Ok(ExecOutcome::new(Some(data), format!("query {}", query)))
    }

    fn handle_subscription(
        &mut self,
        caller: &str,
        artifact_id: &str,
        subscribe: bool,
    ) -> KernelResult<ExecOutcome> {
        if !self.agents.contains_key(caller) {
            return Err(KernelError::Validation(format!(
                "{} is not an agent; only agent loops hold subscriptions",
                caller
            )));
        }
        if subscribe {
            self.store.get_required(artifact_id)?;
        }
        let action = if subscribe { "subscribe" } else { "unsubscribe" };
        self.note_executed(caller, action, Some(artifact_id), None)?;
        let runtime = self.agents.get_mut(caller).expect("checked above");
        let (kind, changed) = if subscribe {
            (
                EventKind::AgentSubscribed,
                runtime.subscriptions.insert(artifact_id.to_string()),
            )
        } else {
            (
                EventKind::AgentUnsubscribed,
                runtime.subscriptions.shift_remove(artifact_id),
            )
        };
        if changed {
            self.emit(
                kind,
                serde_json::json!({ "agent": caller, "artifact_id": artifact_id }),
            )?;
        }
        Ok(ExecOutcome::new(None, format!("{} {}", action, artifact_id)))
    }

    /// `configure_context` / `modify_system_prompt`: field updates on the
    /// agent-principal artifact through the ordinary write path, so
    /// `type`/`created_by` stay untouched and kernel-protected targets stay
    /// rejected.
    fn handle_agent_field(
        &mut self,
        caller: &str,
        action: &str,
        field: &str,
        value: serde_json::Value,
    ) -> KernelResult<ExecOutcome> {
        self.check_permission(caller, AccessKind::Write, caller)?;
        self.note_executed(caller, action, Some(caller), None)?;
        let mut metadata = IndexMap::new();
        let merged = if field == "context" {
            // Context configures incrementally; keys merge over the
            // existing map.
            let mut current = self
                .store
                .get_required(caller)?
                .metadata
                .get("context")
                .and_then(|v| v.as_object().cloned())
                .unwrap_or_default();
            if let serde_json::Value::Object(incoming) = value {
                for (k, v) in incoming {
                    if v.is_null() {
                        current.remove(&k);
                    } else {
                        current.insert(k, v);
                    }
                }
            }
            serde_json::Value::Object(current)
        } else {
            value
        };
        metadata.insert(field.to_string(), merged);
        let event_number = self.journal.next_number();
        let updated = self.store.write(
            caller,
            WritePatch {
                metadata: Some(metadata),
                ..WritePatch::default()
            },
            caller,
            false,
            event_number,
        )?;
        self.emit(
            EventKind::ArtifactWritten,
            serde_json::json!({ "artifact": updated }),
        )?;
        Ok(ExecOutcome::new(None, format!("{} updated", field)))
    }

    // ------------------------------------------------------------------
    // Event helpers
    // ------------------------------------------------------------------

    fn note_executed(
        &mut self,
        principal: &str,
        action: &str,
        target: Option<&str>,
        method: Option<&str>,
    ) -> KernelResult<()> {
        let mut payload = serde_json::json!({ "principal": principal, "action": action });
        if let Some(target) = target {
            payload["target"] = serde_json::json!(target);
        }
        if let Some(method) = method {
            payload["method"] = serde_json::json!(method);
        }
        self.emit(EventKind::ActionExecuted, payload)?;
        Ok(())
    }

    fn note_denial(&mut self, principal: &str, action: &str, target: Option<&str>, err: &KernelError) {
        let payload = serde_json::json!({
            "principal": principal,
            "action": action,
            "target": target,
            "error_code": err.code(),
            "reason": err.to_string(),
        });
        if let Err(e) = self.emit(EventKind::ActionDenied, payload) {
            log::error!("failed to journal denial: {}", e);
        }
    }

    fn require_scrip(&self, principal: &str, amount: u64) -> KernelResult<()> {
        if amount == 0 {
            return Ok(());
        }
        let available = self.ledger.balance(principal)?;
        if available < amount {
            return Err(KernelError::InsufficientFunds {
                principal: principal.to_string(),
                needed: amount,
                available,
            });
        }
        Ok(())
    }

    /// Contract-gated read used by prompt materialization and host code.
    pub fn read_as(&mut self, caller: &str, artifact_id: &str) -> KernelResult<serde_json::Value> {
        let decision = self.check_permission(caller, AccessKind::Read, artifact_id)?;
        self.require_scrip(caller, decision.cost)?;
        let beneficiary = self.store.get_required(artifact_id)?.created_by.clone();
        self.charge_access_cost(caller, &beneficiary, decision.cost)?;
        let artifact = self.store.get_required(artifact_id)?;
        Ok(read_projection(artifact))
    }
}

/// The contract-gated view a reader receives.
fn read_projection(artifact: &Artifact) -> serde_json::Value {
    serde_json::json!({
        "id": artifact.id,
        "type": artifact.artifact_type,
        "created_by": artifact.created_by,
        "content": artifact.content,
        "code": artifact.code,
        "metadata": artifact.metadata,
        "access_contract_id": artifact.access_contract_id,
        "event_number": artifact.event_number,
    })
}

// ----------------------------------------------------------------------
// Interpreter hosts
// ----------------------------------------------------------------------

/// Read-only host handed to executable contracts: state queries only, no
/// mutation reachable.
struct StateHost<'a> {
    kernel: &'a Kernel,
}

impl LangHost for StateHost<'_> {
    fn host_call(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        match name {
            "kernel/balance" => {
                let principal = arg_str(args, 0, "kernel/balance")?;
                let balance = self
                    .kernel
                    .balance_of(principal)
                    .map_err(|e| EvalError::Host(e.to_string()))?;
                Ok(Value::Int(balance as i64))
            }
            "kernel/artifact-exists?" => {
                let id = arg_str(args, 0, "kernel/artifact-exists?")?;
                Ok(Value::Bool(self.kernel.artifact(id).is_some()))
            }
            "kernel/now" => Ok(Value::Int(self.kernel.current_time_ms() as i64)),
            other => Err(EvalError::Host(format!(
                "{} is not available to contracts",
                other
            ))),
        }
    }
}

/// Mutating host for invoked artifact code. Every call acts as the invoking
/// caller; nested invokes re-enter the executor with an incremented depth.
struct ActionHost<'a> {
    kernel: &'a mut Kernel,
    caller: String,
    depth: usize,
}

impl LangHost for ActionHost<'_> {
    fn host_call(&mut self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let host_err = |e: KernelError| EvalError::Host(e.to_string());
        match name {
            "kernel/balance" => {
                let principal = opt_arg_str(args, 0).unwrap_or(&self.caller);
                Ok(Value::Int(
                    self.kernel.balance_of(principal).map_err(host_err)? as i64,
                ))
            }
            "kernel/now" => Ok(Value::Int(self.kernel.current_time_ms() as i64)),
            "kernel/mint-status" => Ok(lang::json_to_value(&self.kernel.mint_status_view())),
            "kernel/get-artifact" => {
                let id = arg_str(args, 0, name)?.to_string();
                let projection = self
                    .kernel
                    .read_as(&self.caller, &id)
                    .map_err(host_err)?;
                Ok(lang::json_to_value(&projection))
            }
            "kernel/list-by-type" => {
                let t = arg_str(args, 0, name)?;
                Ok(Value::Vector(
                    self.kernel
                        .artifacts_by_type(t)
                        .iter()
                        .map(|a| Value::Str(a.id.clone()))
                        .collect(),
                ))
            }
            "kernel/list-by-creator" => {
                let p = arg_str(args, 0, name)?;
                Ok(Value::Vector(
                    self.kernel
                        .artifacts_by_creator(p)
                        .iter()
                        .map(|a| Value::Str(a.id.clone()))
                        .collect(),
                ))
            }
            "kernel/transfer-scrip" => {
                let to = arg_str(args, 0, name)?.to_string();
                let amount = arg_amount(args, 1, name)?;
                let caller = self.caller.clone();
                self.kernel
                    .transfer_scrip(&caller, &to, amount, "code_transfer")
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/transfer-resource" => {
                let to = arg_str(args, 0, name)?.to_string();
                let resource = arg_str(args, 1, name)?.to_string();
                let amount = arg_amount(args, 2, name)?;
                let caller = self.caller.clone();
                self.kernel
                    .transfer_resource(&caller, &to, &resource, amount)
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/consume-quota" => {
                let principal = arg_str(args, 0, name)?.to_string();
                let resource = arg_str(args, 1, name)?.to_string();
                let amount = arg_amount(args, 2, name)?;
                let caller = self.caller.clone();
                self.kernel
                    .consume_quota(&caller, &principal, &resource, amount)
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/submit-for-mint" => {
                let artifact_id = arg_str(args, 0, name)?.to_string();
                let bid = arg_amount(args, 1, name)?;
                let caller = self.caller.clone();
                let submission_id = self
                    .kernel
                    .submit_for_mint(&caller, &artifact_id, bid)
                    .map_err(host_err)?;
                Ok(Value::Str(submission_id))
            }
            "kernel/cancel-mint-submission" => {
                let submission_id = arg_str(args, 0, name)?.to_string();
                let caller = self.caller.clone();
                let refunded = self
                    .kernel
                    .cancel_mint_submission(&caller, &submission_id)
                    .map_err(host_err)?;
                Ok(Value::Int(refunded as i64))
            }
            "kernel/create-principal" => {
                let artifact_id = arg_str(args, 0, name)?.to_string();
                let created_by = self
                    .kernel
                    .artifact(&artifact_id)
                    .map(|a| a.created_by.clone())
                    .ok_or_else(|| EvalError::Host(format!("artifact {} not found", artifact_id)))?;
                if created_by != self.caller {
                    return Err(EvalError::Host(
                        "only the creator may grant an artifact standing".into(),
                    ));
                }
                self.kernel.create_principal(&artifact_id).map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/update-artifact-metadata" => {
                let artifact_id = arg_str(args, 0, name)?.to_string();
                let Some(Value::Map(patch)) = args.get(1) else {
                    return Err(EvalError::Host(format!("{} needs a metadata map", name)));
                };
                let mut metadata = IndexMap::new();
                for (k, v) in patch {
                    metadata.insert(
                        k.clone(),
                        lang::value_to_json(v).map_err(|e| EvalError::Host(e.to_string()))?,
                    );
                }
                let caller = self.caller.clone();
                self.kernel
                    .update_artifact_metadata(&caller, &artifact_id, metadata)
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/grant-charge-delegation" => {
                let delegate = arg_str(args, 0, name)?.to_string();
                let resource = arg_str(args, 1, name)?.to_string();
                let amount = arg_amount(args, 2, name)?;
                let caller = self.caller.clone();
                self.kernel
                    .grant_charge_delegation(&caller, &delegate, &resource, amount)
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/revoke-charge-delegation" => {
                let delegate = arg_str(args, 0, name)?.to_string();
                let caller = self.caller.clone();
                self.kernel
                    .revoke_charge_delegation(&caller, &delegate)
                    .map_err(host_err)?;
                Ok(Value::Bool(true))
            }
            "kernel/invoke" => {
                let artifact_id = arg_str(args, 0, name)?.to_string();
                let method = opt_arg_str(args, 1).map(str::to_string);
                let nested_args = match args.get(2) {
                    None | Some(Value::Nil) => None,
                    Some(v) => Some(
                        lang::value_to_json(v).map_err(|e| EvalError::Host(e.to_string()))?,
                    ),
                };
                let intent = ActionIntent::Invoke {
                    principal_id: self.caller.clone(),
                    artifact_id,
                    method,
                    args: nested_args,
                };
                let result = self.kernel.execute_at_depth(intent, self.depth + 1);
                let json = serde_json::to_value(&result)
                    .map_err(|e| EvalError::Host(e.to_string()))?;
                Ok(lang::json_to_value(&json))
            }
            "kernel/modify-protected-content" => Err(EvalError::Host(
                "kernel-only entrypoint is not reachable from code".into(),
            )),
            other => Err(EvalError::Host(format!("unknown kernel call {}", other))),
        }
    }
}

fn arg_str<'v>(args: &'v [Value], idx: usize, name: &str) -> Result<&'v str, EvalError> {
    args.get(idx)
        .and_then(Value::as_str)
        .ok_or_else(|| EvalError::Host(format!("{} expects a string at position {}", name, idx)))
}

fn opt_arg_str(args: &[Value], idx: usize) -> Option<&str> {
    args.get(idx).and_then(Value::as_str)
}

fn arg_amount(args: &[Value], idx: usize, name: &str) -> Result<u64, EvalError> {
    match args.get(idx) {
        Some(Value::Int(i)) if *i >= 0 => Ok(*i as u64),
        _ => Err(EvalError::Host(format!(
            "{} expects a non-negative integer at position {}",
            name, idx
        ))),
    }
}
