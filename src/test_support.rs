//! In-memory sum node for integration tests.
//!
//! `MemoryNode` speaks the node side of the protocol (`SumService` and
//! `SumInternalService`) over a plain in-memory store and runs oracles in
//! the same JavaScript engine the orchestrator merges with. The oracle
//! runtime exposes `records.Find/New/All/AllBut`, record helpers and
//! `ctx.Error`.

use crate::codec::{build_payload, is_null_record, record_from_compressed_text};
use crate::proto;
use crate::proto::sum_internal_service_server::{SumInternalService, SumInternalServiceServer};
use crate::proto::sum_service_server::{SumService, SumServiceServer};
use crate::script::merge::{envelope, read_report, PRELUDE};
use crate::script::InterpreterPool;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// Node-side oracle API. `__store` holds the node's records, `__embedded`
/// the records the orchestrator inlined as `records.New('<token>')`.
const RUNTIME: &str = r#"
function __wrap(raw) {
    var r = raw || null;
    return {
        ID: r ? r.id : 0,
        Size: r ? r.data.length : 0,
        IsNull: function () { return r === null; },
        Is: function (other) { return r !== null && !other.IsNull() && r.id === other.ID; },
        Data: function () { return r ? r.data.slice() : []; },
        Get: function (i) { return r.data[i]; },
        Meta: function (name) { return r && r.meta.hasOwnProperty(name) ? r.meta[name] : ""; },
        Equal: function (other) { return JSON.stringify(this.Data()) === JSON.stringify(other.Data()); },
        Dot: function (other) {
            if (r === null || other.IsNull()) { throw new Error("dot product with a null record"); }
            var b = other.Data();
            if (b.length !== r.data.length) { throw new Error("vectors have different sizes"); }
            var acc = 0;
            for (var i = 0; i < b.length; i++) { acc += r.data[i] * b[i]; }
            return acc;
        },
        Magnitude: function () { return Math.sqrt(this.Dot(this)); },
        Cosine: function (other) {
            var den = this.Magnitude() * other.Magnitude();
            return den === 0 ? 0 : this.Dot(other) / den;
        }
    };
}
var records = {
    Find: function (id) {
        for (var i = 0; i < __store.length; i++) {
            if (__store[i].id === Number(id)) { return __wrap(__store[i]); }
        }
        return __wrap(null);
    },
    New: function (token) {
        return __wrap(__embedded.hasOwnProperty(token) ? __embedded[token] : null);
    },
    All: function () { return __store.map(__wrap); },
    AllBut: function (exclude) {
        return __store
            .filter(function (raw) { return exclude.IsNull() || raw.id !== exclude.ID; })
            .map(__wrap);
    }
};
"#;

const EMBED_OPEN: &str = "records.New('";

#[derive(Debug, Default)]
struct Store {
    records: BTreeMap<u64, proto::Record>,
    next_record_id: u64,
    oracles: BTreeMap<u64, proto::Oracle>,
    next_oracle_id: u64,
    refuse_deletes: bool,
    bulk_inserts: usize,
}

impl Store {
    fn bump_record_id(&mut self, id: u64) {
        if self.next_record_id <= id {
            self.next_record_id = id + 1;
        }
    }
}

/// A node keeping everything in memory. Clones share the same store, so a
/// test can keep one handle while another is being served.
#[derive(Clone)]
pub struct MemoryNode {
    store: Arc<Mutex<Store>>,
    pool: InterpreterPool,
    started: Instant,
}

impl MemoryNode {
    pub fn new() -> Self {
        Self::with_records(Vec::new())
    }

    /// A node that already holds `records` under their own ids.
    pub fn with_records(records: Vec<proto::Record>) -> Self {
        let mut store = Store {
            next_record_id: 1,
            next_oracle_id: 1,
            ..Store::default()
        };
        for record in records {
            store.bump_record_id(record.id);
            store.records.insert(record.id, record);
        }
        Self {
            store: Arc::new(Mutex::new(store)),
            pool: InterpreterPool::new(2).expect("interpreter pool"),
            started: Instant::now(),
        }
    }

    /// Store an oracle directly, as if it had been created on this node.
    pub fn preload_oracle(&self, name: &str, code: &str) -> u64 {
        let mut store = self.store.lock();
        let id = store.next_oracle_id;
        store.next_oracle_id += 1;
        store.oracles.insert(
            id,
            proto::Oracle {
                id,
                name: name.to_string(),
                code: code.to_string(),
            },
        );
        id
    }

    pub fn records(&self) -> Vec<proto::Record> {
        self.store.lock().records.values().cloned().collect()
    }

    pub fn record_ids(&self) -> Vec<u64> {
        self.store.lock().records.keys().copied().collect()
    }

    pub fn oracles(&self) -> Vec<proto::Oracle> {
        self.store.lock().oracles.values().cloned().collect()
    }

    /// Make privileged bulk deletes fail, as a node with a broken disk would.
    pub fn refuse_deletes(&self, refuse: bool) {
        self.store.lock().refuse_deletes = refuse;
    }

    /// How many `CreateRecordsWithId` calls this node has served.
    pub fn bulk_inserts(&self) -> usize {
        self.store.lock().bulk_inserts
    }

    /// Serve on an ephemeral loopback port.
    pub async fn spawn(&self) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let node = self.clone();
        let handle = tokio::spawn(async move {
            let served = Server::builder()
                .add_service(SumServiceServer::new(node.clone()))
                .add_service(SumInternalServiceServer::new(node))
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await;
            if let Err(err) = served {
                tracing::error!(error = %err, "memory node stopped");
            }
        });
        Ok((addr, handle))
    }

    fn program(&self, oracle: &proto::Oracle, args: &[String]) -> String {
        let (store, embedded) = {
            let store = self.store.lock();
            let rows: Vec<Value> = store.records.values().map(record_json).collect();
            (Value::Array(rows), embedded_records(&oracle.code))
        };
        format!(
            "{PRELUDE}\n{RUNTIME}\nvar __store = {store};\nvar __embedded = {embedded};\n{}\n{}",
            oracle.code,
            envelope(&format!("{}({})", oracle.name, args.join(", ")))
        )
    }
}

impl Default for MemoryNode {
    fn default() -> Self {
        Self::new()
    }
}

fn record_json(record: &proto::Record) -> Value {
    json!({ "id": record.id, "data": record.data, "meta": record.meta })
}

/// Decode every `records.New('<token>')` literal in `code`.
fn embedded_records(code: &str) -> Value {
    let mut embedded = Map::new();
    let mut rest = code;
    while let Some(start) = rest.find(EMBED_OPEN) {
        rest = &rest[start + EMBED_OPEN.len()..];
        let Some(end) = rest.find('\'') else {
            break;
        };
        let token = &rest[..end];
        let value = match record_from_compressed_text(token) {
            Ok(record) if !is_null_record(&record) => record_json(&record),
            _ => Value::Null,
        };
        embedded.insert(token.to_string(), value);
        rest = &rest[end..];
    }
    Value::Object(embedded)
}

fn paging(page: u64, per_page: u64, total: usize) -> (u64, u64, Option<(usize, usize)>) {
    let page = page.max(1);
    let per_page = per_page.max(1);
    let total = total as u64;
    let pages = total.div_ceil(per_page);
    let start = (page - 1).saturating_mul(per_page);
    if start >= total {
        return (total, pages, None);
    }
    let end = start.saturating_add(per_page).min(total);
    (total, pages, Some((start as usize, end as usize)))
}

fn record_failure(msg: impl Into<String>) -> Response<proto::RecordResponse> {
    Response::new(proto::RecordResponse {
        success: false,
        msg: msg.into(),
        record: None,
    })
}

fn record_success(msg: impl Into<String>, record: Option<proto::Record>) -> Response<proto::RecordResponse> {
    Response::new(proto::RecordResponse {
        success: true,
        msg: msg.into(),
        record,
    })
}

fn oracle_response(success: bool, msg: impl Into<String>, oracles: Vec<proto::Oracle>) -> Response<proto::OracleResponse> {
    Response::new(proto::OracleResponse {
        success,
        msg: msg.into(),
        oracles,
    })
}

fn call_failure(msg: impl Into<String>) -> Response<proto::CallResponse> {
    Response::new(proto::CallResponse {
        success: false,
        msg: msg.into(),
        data: None,
    })
}

const NOT_UNIQUE: &str = "identifier is not unique";

#[tonic::async_trait]
impl SumService for MemoryNode {
    async fn create_record(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let mut record = request.into_inner();
        let mut store = self.store.lock();
        record.id = store.next_record_id;
        store.next_record_id += 1;
        let id = record.id;
        store.records.insert(id, record);
        Ok(record_success(id.to_string(), None))
    }

    async fn create_records(&self, request: Request<proto::Records>) -> Result<Response<proto::RecordResponse>, Status> {
        let records = request.into_inner().records;
        let mut store = self.store.lock();
        let count = records.len();
        for mut record in records {
            record.id = store.next_record_id;
            store.next_record_id += 1;
            store.records.insert(record.id, record);
        }
        Ok(record_success(count.to_string(), None))
    }

    async fn update_record(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let record = request.into_inner();
        let mut store = self.store.lock();
        match store.records.get_mut(&record.id) {
            Some(slot) => {
                *slot = record;
                Ok(record_success("", None))
            }
            None => Ok(record_failure("record not found")),
        }
    }

    async fn read_record(&self, request: Request<proto::ById>) -> Result<Response<proto::RecordResponse>, Status> {
        let id = request.into_inner().id;
        match self.store.lock().records.get(&id) {
            Some(record) => Ok(record_success("", Some(record.clone()))),
            None => Ok(record_failure(format!("record {id} not found."))),
        }
    }

    async fn list_records(&self, request: Request<proto::ListRequest>) -> Result<Response<proto::RecordListResponse>, Status> {
        let request = request.into_inner();
        let store = self.store.lock();
        let (total, pages, window) = paging(request.page, request.per_page, store.records.len());
        let records = window
            .map(|(start, end)| store.records.values().skip(start).take(end - start).cloned().collect())
            .unwrap_or_default();
        Ok(Response::new(proto::RecordListResponse { total, pages, records }))
    }

    async fn delete_record(&self, request: Request<proto::ById>) -> Result<Response<proto::RecordResponse>, Status> {
        let id = request.into_inner().id;
        match self.store.lock().records.remove(&id) {
            Some(_) => Ok(record_success("", None)),
            None => Ok(record_failure(format!("record {id} not found."))),
        }
    }

    async fn find_records(&self, request: Request<proto::ByMeta>) -> Result<Response<proto::FindResponse>, Status> {
        let query = request.into_inner();
        let store = self.store.lock();
        if !store.records.values().any(|r| r.meta.contains_key(&query.meta)) {
            return Ok(Response::new(proto::FindResponse {
                success: false,
                msg: format!("meta {} not indexed.", query.meta),
                records: Vec::new(),
            }));
        }
        let records = store
            .records
            .values()
            .filter(|r| r.meta.get(&query.meta) == Some(&query.value))
            .cloned()
            .collect();
        Ok(Response::new(proto::FindResponse {
            success: true,
            msg: String::new(),
            records,
        }))
    }

    async fn create_oracle(&self, request: Request<proto::Oracle>) -> Result<Response<proto::OracleResponse>, Status> {
        let oracle = request.into_inner();
        let id = self.preload_oracle(&oracle.name, &oracle.code);
        Ok(oracle_response(true, id.to_string(), Vec::new()))
    }

    async fn update_oracle(&self, request: Request<proto::Oracle>) -> Result<Response<proto::OracleResponse>, Status> {
        let oracle = request.into_inner();
        let mut store = self.store.lock();
        match store.oracles.get_mut(&oracle.id) {
            Some(slot) => {
                *slot = oracle;
                Ok(oracle_response(true, "", Vec::new()))
            }
            None => Ok(oracle_response(false, format!("oracle {} not found.", oracle.id), Vec::new())),
        }
    }

    async fn read_oracle(&self, request: Request<proto::ById>) -> Result<Response<proto::OracleResponse>, Status> {
        let id = request.into_inner().id;
        match self.store.lock().oracles.get(&id) {
            Some(oracle) => Ok(oracle_response(true, "", vec![oracle.clone()])),
            None => Ok(oracle_response(false, format!("oracle {id} not found."), Vec::new())),
        }
    }

    async fn find_oracle(&self, request: Request<proto::ByName>) -> Result<Response<proto::OracleResponse>, Status> {
        let name = request.into_inner().name;
        let store = self.store.lock();
        match store.oracles.values().find(|o| o.name == name) {
            Some(oracle) => Ok(oracle_response(true, "", vec![oracle.clone()])),
            None => Ok(oracle_response(false, format!("oracle '{name}' not found."), Vec::new())),
        }
    }

    async fn list_oracles(&self, request: Request<proto::ListRequest>) -> Result<Response<proto::OracleListResponse>, Status> {
        let request = request.into_inner();
        let store = self.store.lock();
        let (total, pages, window) = paging(request.page, request.per_page, store.oracles.len());
        let oracles = window
            .map(|(start, end)| store.oracles.values().skip(start).take(end - start).cloned().collect())
            .unwrap_or_default();
        Ok(Response::new(proto::OracleListResponse { total, pages, oracles }))
    }

    async fn delete_oracle(&self, request: Request<proto::ById>) -> Result<Response<proto::OracleResponse>, Status> {
        let id = request.into_inner().id;
        match self.store.lock().oracles.remove(&id) {
            Some(_) => Ok(oracle_response(true, "", Vec::new())),
            None => Ok(oracle_response(false, format!("oracle {id} not found."), Vec::new())),
        }
    }

    async fn run(&self, request: Request<proto::Call>) -> Result<Response<proto::CallResponse>, Status> {
        let call = request.into_inner();
        let Some(oracle) = self.store.lock().oracles.get(&call.oracle_id).cloned() else {
            return Ok(call_failure(format!("oracle {} not found.", call.oracle_id)));
        };

        let program = self.program(&oracle, &call.args);
        let value = match self.pool.eval(program).await.and_then(|raw| read_report(&raw)) {
            Ok(value) => value,
            Err(err) => {
                return Ok(call_failure(format!(
                    "Error while running oracle {}: {err}",
                    call.oracle_id
                )))
            }
        };
        let raw = serde_json::to_vec(&value).map_err(|e| Status::internal(e.to_string()))?;
        let data = build_payload(raw).map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::CallResponse {
            success: true,
            msg: String::new(),
            data: Some(data),
        }))
    }

    async fn info(&self, _request: Request<proto::Empty>) -> Result<Response<proto::ServerInfo>, Status> {
        let store = self.store.lock();
        Ok(Response::new(proto::ServerInfo {
            version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpus: 1,
            uptime: self.started.elapsed().as_secs(),
            pid: u64::from(std::process::id()),
            records: store.records.len() as u64,
            oracles: store.oracles.len() as u64,
            next_record_id: store.next_record_id,
            next_oracle_id: store.next_oracle_id,
            ..Default::default()
        }))
    }
}

#[tonic::async_trait]
impl SumInternalService for MemoryNode {
    async fn create_record_with_id(&self, request: Request<proto::Record>) -> Result<Response<proto::RecordResponse>, Status> {
        let record = request.into_inner();
        let mut store = self.store.lock();
        if store.records.contains_key(&record.id) {
            return Ok(record_failure(NOT_UNIQUE));
        }
        let id = record.id;
        store.bump_record_id(id);
        store.records.insert(id, record);
        Ok(record_success(id.to_string(), None))
    }

    async fn create_records_with_id(&self, request: Request<proto::Records>) -> Result<Response<proto::RecordResponse>, Status> {
        let records = request.into_inner().records;
        let mut store = self.store.lock();
        store.bulk_inserts += 1;
        if records.iter().any(|r| store.records.contains_key(&r.id)) {
            return Ok(record_failure(NOT_UNIQUE));
        }
        let count = records.len();
        for record in records {
            store.bump_record_id(record.id);
            store.records.insert(record.id, record);
        }
        Ok(record_success(count.to_string(), None))
    }

    async fn delete_records(&self, request: Request<proto::RecordIds>) -> Result<Response<proto::RecordResponse>, Status> {
        let ids = request.into_inner().ids;
        let mut store = self.store.lock();
        if store.refuse_deletes {
            return Ok(record_failure("unable to delete records"));
        }
        let deleted = ids.iter().filter(|id| store.records.remove(*id).is_some()).count();
        Ok(record_success(deleted.to_string(), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{decode_payload, null_record, record_to_compressed_text};

    fn record(id: u64, data: Vec<f32>) -> proto::Record {
        proto::Record {
            id,
            data,
            meta: BTreeMap::new(),
        }
    }

    async fn run(node: &MemoryNode, name: &str, code: &str, args: &[&str]) -> proto::CallResponse {
        let id = node.preload_oracle(name, code);
        node.run(Request::new(proto::Call {
            oracle_id: id,
            args: args.iter().map(|a| a.to_string()).collect(),
        }))
        .await
        .unwrap()
        .into_inner()
    }

    #[tokio::test]
    async fn oracles_see_local_records() {
        let node = MemoryNode::with_records(vec![record(1, vec![1.0, 2.0]), record(2, vec![3.0, 4.0])]);
        let resp = run(
            &node,
            "dot",
            "function dot(a, b) { return records.Find(a).Dot(records.Find(b)); }",
            &["1", "2"],
        )
        .await;
        assert!(resp.success, "{}", resp.msg);
        assert_eq!(decode_payload(&resp.data.unwrap()).unwrap(), json!(11));
    }

    #[tokio::test]
    async fn embedded_records_resolve() {
        let node = MemoryNode::with_records(vec![record(2, vec![1.0])]);
        let token = record_to_compressed_text(&record(9, vec![5.0])).unwrap();
        let missing = record_to_compressed_text(&null_record()).unwrap();
        let code = format!(
            "function inspect() {{ var r = records.New('{token}'); var m = records.New('{missing}'); \
             return [r.ID, r.Get(0), m.IsNull(), records.AllBut(r).length]; }}"
        );
        let resp = run(&node, "inspect", &code, &[]).await;
        assert!(resp.success, "{}", resp.msg);
        assert_eq!(decode_payload(&resp.data.unwrap()).unwrap(), json!([9, 5, true, 1]));
    }

    #[tokio::test]
    async fn signalled_failures_are_reported() {
        let node = MemoryNode::new();
        let resp = run(&node, "fail", "function fail() { return ctx.Error('nope'); }", &[]).await;
        assert!(!resp.success);
        assert!(resp.msg.contains("nope"), "{}", resp.msg);
    }

    #[tokio::test]
    async fn meta_lookups_need_an_indexed_key() {
        let mut tagged = record(1, vec![1.0]);
        tagged.meta.insert("color".into(), "red".into());
        let node = MemoryNode::with_records(vec![tagged, record(2, vec![2.0])]);

        let found = node
            .find_records(Request::new(proto::ByMeta {
                meta: "color".into(),
                value: "red".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert!(found.success);
        assert_eq!(found.records.len(), 1);

        let missing = node
            .find_records(Request::new(proto::ByMeta {
                meta: "shape".into(),
                value: "round".into(),
            }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(missing.msg, "meta shape not indexed.");
    }

    #[test]
    fn paging_clamps_and_reports_totals() {
        assert_eq!(paging(0, 0, 3), (3, 3, Some((0, 1))));
        assert_eq!(paging(2, 2, 3), (3, 2, Some((2, 3))));
        assert_eq!(paging(3, 2, 3), (3, 2, None));
    }
}
