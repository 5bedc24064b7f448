use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};

/// Drive the stdio server end-to-end: register a scratch repo, refresh it,
/// search, slice, and read a hot path — all over line-delimited JSON-RPC.
#[test]
fn mcp_stdio_smoke() {
    // `cargo test` sets this for integration tests.
    let bin = env!("CARGO_BIN_EXE_symledger");

    let state_dir = tempfile::tempdir().expect("state dir");
    let repo_dir = tempfile::tempdir().expect("repo dir");
    std::fs::write(
        repo_dir.path().join("a.ts"),
        "export function f(){ g(); }\nfunction g(){}\n",
    )
    .unwrap();

    let mut child = Command::new(bin)
        .arg("--state-dir")
        .arg(state_dir.path())
        .arg("serve")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn symledger serve");

    {
        let stdin = child.stdin.as_mut().expect("child stdin");

        // Keep each JSON-RPC message on one line (server reads by lines()).
        let messages = vec![
            serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "method": "initialize",
                "params": { "protocolVersion": "2024-11-05" }
            }),
            serde_json::json!({ "jsonrpc": "2.0", "id": 2, "method": "tools/list" }),
            serde_json::json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": { "name": "repo.register", "arguments": {
                    "repoId": "demo", "rootPath": repo_dir.path().to_string_lossy()
                } }
            }),
            serde_json::json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": { "name": "index.refresh", "arguments": {
                    "repoId": "demo", "mode": "full"
                } }
            }),
            serde_json::json!({
                "jsonrpc": "2.0", "id": 5, "method": "tools/call",
                "params": { "name": "symbol.search", "arguments": {
                    "repoId": "demo", "query": "f"
                } }
            }),
            serde_json::json!({
                "jsonrpc": "2.0", "id": 6, "method": "tools/call",
                "params": { "name": "slice.build", "arguments": {
                    "repoId": "demo", "taskText": "call g",
                    "budget": { "maxCards": 1, "maxEstimatedTokens": 10000 }
                } }
            }),
            serde_json::json!({
                "jsonrpc": "2.0", "id": 7, "method": "tools/call",
                "params": { "name": "code.getHotPath", "arguments": {
                    "repoId": "demo", "symbolId": "a.ts#f",
                    "identifiersToFind": ["g"], "contextLines": 1
                } }
            }),
        ];
        for m in messages {
            writeln!(stdin, "{m}").unwrap();
        }
    }

    // Close stdin so the server loop can exit.
    drop(child.stdin.take());

    let stdout = child.stdout.take().expect("child stdout");
    let mut responses: Vec<serde_json::Value> = Vec::new();
    for line in BufReader::new(stdout).lines() {
        let line = line.expect("read line");
        if line.trim().is_empty() {
            continue;
        }
        responses.push(serde_json::from_str(&line).expect("valid json response"));
    }
    let status = child.wait().expect("server exit");
    assert!(status.success(), "server exited with {status}");

    assert_eq!(responses.len(), 7, "one response per request");
    assert_eq!(responses[0]["result"]["serverInfo"]["name"], "symledger");
    assert!(responses[1]["result"]["tools"].as_array().unwrap().len() >= 12);

    let tool_payload = |idx: usize| -> serde_json::Value {
        let text = responses[idx]["result"]["content"][0]["text"].as_str().unwrap();
        serde_json::from_str(text).unwrap()
    };

    let registered = tool_payload(2);
    assert_eq!(registered["ok"], true);

    let refreshed = tool_payload(3);
    let version = refreshed["versionId"].as_str().unwrap();
    assert!(version.starts_with("demo-v"));
    assert_eq!(refreshed["changedFiles"], 1);
    assert_eq!(refreshed["symbolsIndexed"], 2);

    let hits = tool_payload(4);
    assert_eq!(hits[0]["symbolId"], "a.ts#f");

    let sliced = tool_payload(5);
    assert_eq!(sliced["slice"]["cards"].as_array().unwrap().len(), 1);
    assert_eq!(sliced["slice"]["cards"][0]["symbolId"], "a.ts#g");
    assert_eq!(sliced["slice"]["truncation"]["truncated"], true);

    let hot = tool_payload(6);
    assert!(hot["excerpt"].as_str().unwrap().contains("g()"));
}
