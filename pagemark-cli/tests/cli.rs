use std::fs;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::TcpListener;
use std::path::Path;
use std::thread;

use assert_cmd::Command;
use pagemark_core::fingerprint_for_bytes;
use tempfile::tempdir;

const DOCUMENT: &[u8] = b"%PDF-1.7\n1 0 obj << /Type /Catalog >> endobj\n%%EOF\n";

fn pagemark(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pagemark").unwrap();
    cmd.arg("--data-dir")
        .arg(data_dir)
        .arg("--config")
        .arg(data_dir.join("config.toml"))
        .env("RUST_LOG", "warn");
    cmd
}

fn stdout_of(cmd: &mut Command) -> String {
    let output = cmd.assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
}

#[test]
fn open_then_restore_from_cache() {
    let dir = tempdir().unwrap();
    let doc = dir.path().join("paper.pdf");
    fs::write(&doc, DOCUMENT).unwrap();
    let fingerprint = fingerprint_for_bytes(DOCUMENT);

    let opened = stdout_of(pagemark(dir.path()).arg("open").arg(&doc));
    assert!(opened.contains(&fingerprint), "{opened}");
    assert!(opened.contains("paper.pdf"), "{opened}");
    assert!(opened.contains("0 annotations"), "{opened}");

    fs::remove_file(&doc).unwrap();
    let restored = stdout_of(pagemark(dir.path()).arg("restore"));
    assert!(
        restored.contains(&format!("restored {fingerprint} from cache")),
        "{restored}"
    );
}

#[test]
fn fresh_install_has_nothing_to_restore() {
    let dir = tempdir().unwrap();
    let restored = stdout_of(pagemark(dir.path()).arg("restore"));
    assert!(restored.contains("nothing to restore"), "{restored}");

    let exported = stdout_of(pagemark(dir.path()).arg("export"));
    let records: serde_json::Value = serde_json::from_str(exported.trim()).unwrap();
    assert_eq!(records, serde_json::json!([]));
}

#[test]
fn unknown_annotation_type_is_rejected() {
    let dir = tempdir().unwrap();
    let doc = dir.path().join("paper.pdf");
    fs::write(&doc, DOCUMENT).unwrap();
    pagemark(dir.path())
        .args(["draw", "--subtype", "Hologram", "--at", "1,1"])
        .arg(&doc)
        .assert()
        .failure();
}

struct Request {
    line: String,
    body: String,
}

fn serve(responses: Vec<&'static str>) -> (String, thread::JoinHandle<Vec<Request>>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = thread::spawn(move || {
        let mut requests = Vec::new();
        for (status, body) in responses.into_iter().map(|r| r.split_once('|').unwrap()) {
            let (mut stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            let mut length = 0;
            loop {
                let mut header = String::new();
                reader.read_line(&mut header).unwrap();
                if header == "\r\n" || header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        length = value.trim().parse().unwrap();
                    }
                }
            }
            let mut payload = vec![0; length];
            reader.read_exact(&mut payload).unwrap();
            requests.push(Request {
                line: line.trim_end().to_string(),
                body: String::from_utf8(payload).unwrap(),
            });
            let reply = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(reply.as_bytes()).unwrap();
        }
        requests
    });
    (format!("http://{addr}/annotations"), handle)
}

#[test]
fn drawn_square_is_saved_to_the_endpoint() {
    let dir = tempdir().unwrap();
    let doc = dir.path().join("paper.pdf");
    fs::write(&doc, DOCUMENT).unwrap();
    let (endpoint, server) = serve(vec!["404 Not Found|", "200 OK|{\"ok\":true}"]);

    let out = stdout_of(
        pagemark(dir.path())
            .args(["--endpoint", &endpoint, "--username", "tester"])
            .args(["draw", "--subtype", "Square", "--page", "1"])
            .args(["--at", "10,10", "--at", "60,40", "--at", "100,80"])
            .args(["--text", "check margins"])
            .arg(&doc),
    );
    assert!(out.contains("created"), "{out}");

    let requests = server.join().unwrap();
    let fingerprint = fingerprint_for_bytes(DOCUMENT);
    assert_eq!(
        requests[0].line,
        format!("GET /annotations?docId={fingerprint}&username=tester HTTP/1.1")
    );
    assert!(requests[1].line.starts_with("POST "));

    let sent: serde_json::Value = serde_json::from_str(&requests[1].body).unwrap();
    let record = &sent[0];
    assert_eq!(sent.as_array().unwrap().len(), 1);
    assert_eq!(record["subtype"], "Square");
    assert_eq!(record["title"], "tester");
    assert_eq!(record["pageNumber"], 1);
    assert_eq!(record["contentsObj"]["text"], "check margins");
    assert_eq!(
        record["geometry"],
        serde_json::json!({"type": "rect", "x0": 10.0, "y0": 10.0, "x1": 100.0, "y1": 80.0})
    );
}
