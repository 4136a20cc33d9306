//! Multi-step workflow driver.
//!
//! # Design
//! A wizard lives server-side as named states plus a session id. The raw
//! proxy exposes the three lifecycle calls (`create`, `execute`, `delete`);
//! [`WizardSession`] layers the state machine on top: each `run` posts the
//! accumulated per-state data, and the reply either suspends on a view
//! (its defaults are merged into the data so the caller can fill the rest)
//! or finishes the workflow. `with_session` scopes a session and deletes it
//! server-side no matter how the closure exits.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::codec::{encode_to_string, Value, ValueMap};
use crate::error::Result;
use crate::http::{HttpMethod, HttpRequest};
use crate::model::malformed_response;
use crate::session::{Context, Session};

/// Per-state input accumulated while a wizard session runs.
pub type WizardData = BTreeMap<String, ValueMap>;

/// Proxy for one named wizard.
#[derive(Debug, Clone)]
pub struct Wizard<'a> {
    session: &'a Session,
    name: String,
}

impl<'a> Wizard<'a> {
    pub(crate) fn new(session: &'a Session, name: String) -> Self {
        Wizard { session, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn url(&self, action: &str) -> String {
        format!("{}/wizard/{}/{}", self.session.base_url(), self.name, action)
    }

    /// Open a server-side session; returns its id and the start and end
    /// state names.
    pub fn create(&self, ctx: Option<&Context>) -> Result<(Value, String, String)> {
        debug!(wizard = %self.name, "create");
        let mut request = HttpRequest::new(HttpMethod::Put, self.url("create"));
        request.body = Some(encode_to_string(&Value::List(Vec::new())));
        self.session.attach_context(&mut request, ctx);
        let reply = self.session.execute(request)?;
        let items = match reply {
            Value::List(items) => items,
            other => {
                return Err(malformed_response(format!(
                    "wizard create returned {}",
                    other.kind_name()
                )))
            }
        };
        let [session_id, start, end] = <[Value; 3]>::try_from(items).map_err(|items| {
            malformed_response(format!("wizard create returned {} items", items.len()))
        })?;
        let start = expect_state(&start)?;
        let end = expect_state(&end)?;
        Ok((session_id, start, end))
    }

    /// Run one transition of an open session.
    pub fn execute(
        &self,
        session_id: &Value,
        data: &WizardData,
        state: &str,
        ctx: Option<&Context>,
    ) -> Result<ValueMap> {
        debug!(wizard = %self.name, state, "execute");
        let mut request = HttpRequest::new(HttpMethod::Put, self.url("execute"));
        let body = Value::List(vec![
            session_id.clone(),
            data_to_value(data),
            Value::from(state),
        ]);
        request.body = Some(encode_to_string(&body));
        self.session.attach_context(&mut request, ctx);
        expect_result(self.session.execute(request)?)
    }

    /// Drop a server-side session.
    pub fn delete(&self, session_id: &Value) -> Result<()> {
        debug!(wizard = %self.name, "delete");
        let mut request = HttpRequest::new(HttpMethod::Put, self.url("delete"));
        request.body = Some(encode_to_string(&Value::List(vec![session_id.clone()])));
        self.session.execute(request)?;
        Ok(())
    }

    /// Open a session and run its first transition into the start state.
    pub fn session(&self, ctx: Option<&Context>) -> Result<WizardSession<'a>> {
        WizardSession::start(self.clone(), ctx.cloned())
    }

    /// Run `work` inside a scoped session. The server-side session is
    /// deleted afterwards even when the closure fails; the closure's error
    /// wins over a cleanup error.
    pub fn with_session<T>(
        &self,
        ctx: Option<&Context>,
        work: impl FnOnce(&mut WizardSession<'a>) -> Result<T>,
    ) -> Result<T> {
        let mut session = self.session(ctx)?;
        let outcome = work(&mut session);
        let cleanup = session.delete();
        match outcome {
            Ok(value) => cleanup.map(|()| value),
            Err(err) => {
                if let Err(cleanup_err) = cleanup {
                    warn!(wizard = %self.name, error = %cleanup_err, "session cleanup failed");
                }
                Err(err)
            }
        }
    }
}

/// Outcome of one [`WizardSession::run`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum WizardStep {
    /// The wizard paused on a view and wants input for `view_state`.
    Suspended { view_state: String, result: ValueMap },
    /// The workflow reached its end state.
    Finished(ValueMap),
}

impl WizardStep {
    pub fn is_finished(&self) -> bool {
        matches!(self, WizardStep::Finished(_))
    }

    pub fn result(&self) -> &ValueMap {
        match self {
            WizardStep::Suspended { result, .. } => result,
            WizardStep::Finished(result) => result,
        }
    }
}

/// One open workflow instance.
pub struct WizardSession<'a> {
    wizard: Wizard<'a>,
    context: Option<Context>,
    session_id: Value,
    start_state: String,
    end_state: String,
    state: String,
    data: WizardData,
    last_result: ValueMap,
}

impl<'a> WizardSession<'a> {
    fn start(wizard: Wizard<'a>, context: Option<Context>) -> Result<Self> {
        let (session_id, start_state, end_state) = wizard.create(context.as_ref())?;
        let mut session = WizardSession {
            wizard,
            context,
            session_id,
            state: start_state.clone(),
            start_state,
            end_state,
            data: WizardData::new(),
            last_result: ValueMap::new(),
        };
        let start = session.start_state.clone();
        session.run(&start)?;
        Ok(session)
    }

    /// Transition from `state`. Suspends when the server answers with a
    /// view, otherwise the workflow is finished.
    pub fn run(&mut self, state: &str) -> Result<WizardStep> {
        self.state = state.to_string();
        if self.state == self.end_state {
            return Ok(WizardStep::Finished(self.last_result.clone()));
        }
        let result = self.wizard.execute(
            &self.session_id,
            &self.data,
            &self.state,
            self.context.as_ref(),
        )?;
        self.last_result = result.clone();
        let suspended = match result.get("view") {
            Some(view) => Some(parse_view(view)?),
            None => None,
        };
        match suspended {
            Some((view_state, defaults)) => {
                self.data
                    .entry(view_state.clone())
                    .or_default()
                    .extend(defaults);
                Ok(WizardStep::Suspended { view_state, result })
            }
            None => {
                self.state = self.end_state.clone();
                Ok(WizardStep::Finished(result))
            }
        }
    }

    /// Stage an input value for one state before the next `run`.
    pub fn set_value(&mut self, state: &str, field: &str, value: impl Into<Value>) {
        self.data
            .entry(state.to_string())
            .or_default()
            .insert(field.to_string(), value.into());
    }

    pub fn data(&self) -> &WizardData {
        &self.data
    }

    pub fn session_id(&self) -> &Value {
        &self.session_id
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn start_state(&self) -> &str {
        &self.start_state
    }

    pub fn end_state(&self) -> &str {
        &self.end_state
    }

    pub fn is_finished(&self) -> bool {
        self.state == self.end_state
    }

    /// Drop the server-side session.
    pub fn delete(self) -> Result<()> {
        self.wizard.delete(&self.session_id)
    }
}

fn data_to_value(data: &WizardData) -> Value {
    Value::Map(
        data.iter()
            .map(|(state, values)| (state.clone(), Value::Map(values.clone())))
            .collect(),
    )
}

fn expect_state(value: &Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| malformed_response(format!("state name is {}", value.kind_name())))
}

fn expect_result(value: Value) -> Result<ValueMap> {
    match value {
        Value::Map(map) => Ok(map),
        Value::Null => Ok(ValueMap::new()),
        other => Err(malformed_response(format!(
            "wizard result is {}",
            other.kind_name()
        ))),
    }
}

fn parse_view(view: &Value) -> Result<(String, Vec<(String, Value)>)> {
    let view = view
        .as_map()
        .ok_or_else(|| malformed_response(format!("view is {}", view.kind_name())))?;
    let state = view
        .get("state")
        .and_then(Value::as_str)
        .ok_or_else(|| malformed_response("view has no state name".to_string()))?
        .to_string();
    let defaults = view
        .get("defaults")
        .and_then(Value::as_map)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    Ok((state, defaults))
}
