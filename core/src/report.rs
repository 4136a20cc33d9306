//! Server-rendered report execution.

use tracing::debug;

use crate::codec::{encode_to_string, Value, ValueMap};
use crate::error::Result;
use crate::http::{HttpMethod, HttpRequest};
use crate::session::{Context, Session};

/// Proxy for one named report.
///
/// Reports render server-side over a set of records plus free-form
/// parameters; the reply is a codec value, typically a bytes envelope
/// carrying the rendered document.
#[derive(Debug, Clone)]
pub struct Report<'a> {
    session: &'a Session,
    name: String,
}

impl<'a> Report<'a> {
    pub(crate) fn new(session: &'a Session, name: String) -> Self {
        Report { session, name }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn execute(
        &self,
        records: &[i64],
        data: &ValueMap,
        ctx: Option<&Context>,
    ) -> Result<Value> {
        debug!(report = %self.name, records = records.len(), "execute");
        let url = format!("{}/report/{}", self.session.base_url(), self.name);
        let mut request = HttpRequest::new(HttpMethod::Put, url);
        let mut body = ValueMap::new();
        body.insert(
            "objects".to_string(),
            Value::List(records.iter().map(|id| Value::Int(*id)).collect()),
        );
        body.insert("data".to_string(), Value::Map(data.clone()));
        request.body = Some(encode_to_string(&Value::Map(body)));
        self.session.attach_context(&mut request, ctx);
        self.session.execute(request)
    }
}
