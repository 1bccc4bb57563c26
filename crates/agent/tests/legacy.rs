use loupe_agent::{Broker, Input, MethodRegistry, Output};
use loupe_store::EnvMap;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::io::{self, Cursor, Write};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn serve(registry: MethodRegistry, input: &str) -> (u64, Vec<Value>) {
    let out = SharedBuf::default();
    let broker = Broker::new("test", Arc::new(registry), 4);
    let stats = broker
        .serve(
            Input::Reader(Box::new(Cursor::new(input.as_bytes().to_vec()))),
            Output::Writer(Box::new(out.clone())),
        )
        .await
        .unwrap();
    let text = String::from_utf8(out.0.lock().unwrap().clone()).unwrap();
    let lines = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    (stats.served, lines)
}

fn by_token<'a>(lines: &'a [Value], token: &str) -> &'a Value {
    lines
        .iter()
        .find(|l| l["token"] == token)
        .unwrap_or_else(|| panic!("no response for {token}: {lines:?}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn hello_calls_and_bye() {
    let registry = MethodRegistry::with_builtins(EnvMap::new().add("GOPATH", "/go"));
    let input = concat!(
        "{\"Method\":\"hello\",\"Token\":\"t1\"}\t{\"s\":\"hi\"}\n",
        "\n",
        "{\"Method\":\"env\",\"Token\":\"t2\"}\t{\"List\":[\"GOPATH\"]}\n",
        "{\"Method\":\"bye-ni\",\"Token\":\"t3\"}\n",
        "{\"Method\":\"hello\",\"Token\":\"t4\"}\n",
    );
    let (served, lines) = serve(registry, input).await;
    assert_eq!(served, 2);

    assert_eq!(lines[0]["token"], "margo.hello");
    assert_eq!(lines[0]["tag"], "test");
    assert_eq!(by_token(&lines, "t1")["data"], json!({"s": "hi"}));
    assert_eq!(by_token(&lines, "t2")["data"], json!({"GOPATH": "/go"}));
    assert!(lines.iter().all(|l| l["token"] != "t4"));

    let bye = lines.last().unwrap();
    assert_eq!(bye["token"], "margo.bye-ni");
    assert_eq!(bye["data"]["served"], 2);
    assert!(bye["data"]["uptime"].is_string());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_methods_and_panics_are_answered() {
    let registry = MethodRegistry::new();
    registry
        .register("boom", |_| -> Result<Value, String> { panic!("boom") })
        .unwrap();
    registry
        .register("fail", |_| Err("no luck".to_string()))
        .unwrap();
    let input = concat!(
        "{\"Method\":\"nope\",\"Token\":\"t1\"}\n",
        "{\"Method\":\"boom\",\"Token\":\"t2\"}\n",
        "{\"Method\":\"fail\",\"Token\":\"t3\"}\n",
    );
    let (served, lines) = serve(registry, input).await;
    assert_eq!(served, 2);
    assert_eq!(by_token(&lines, "t1")["error"], "Invalid method nope");
    assert_eq!(by_token(&lines, "t2")["error"], "broker: boom#t2 PANIC");
    assert_eq!(by_token(&lines, "t3")["error"], "no luck");
    assert_eq!(by_token(&lines, "t3")["data"], json!({}));
    assert_eq!(lines.last().unwrap()["token"], "margo.bye-ni");
}
