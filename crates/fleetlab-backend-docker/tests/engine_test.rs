//! Docker adapter against a scripted engine on a local TCP port

use bollard::Docker;
use fleetlab_backend::tags::NodeTags;
use fleetlab_backend::{
    Arch, DeployRequest, DockerExtra, Expiry, Features, FleetBackend, FleetError, GroupId,
    GroupKind, GroupName, NodeNo, ProviderExtra, TemplateKey,
};
use fleetlab_backend_docker::DockerBackend;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

type Route = Arc<dyn Fn(&str, &str) -> (u16, String) + Send + Sync>;

struct Engine {
    addr: SocketAddr,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Engine {
    async fn start(route: impl Fn(&str, &str) -> (u16, String) + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let route: Route = Arc::new(route);

        let log = calls.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (route, log) = (route.clone(), log.clone());
                tokio::spawn(async move {
                    let _ = serve(stream, route, log).await;
                });
            }
        });
        Self { addr, calls }
    }

    fn backend(&self) -> DockerBackend {
        let docker = Docker::connect_with_http(
            &format!("http://{}", self.addr),
            5,
            bollard::API_DEFAULT_VERSION,
        )
        .unwrap();
        DockerBackend::from_client(docker)
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

/// Minimal HTTP/1.1 loop: one response per request, keep-alive
async fn serve(stream: TcpStream, route: Route, log: Arc<Mutex<Vec<String>>>) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream);
    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).await? == 0 {
            return Ok(());
        }
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut length = 0usize;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).await?;
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((key, value)) = header.split_once(':')
                && key.eq_ignore_ascii_case("content-length")
            {
                length = value.trim().parse().unwrap_or(0);
            }
        }
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await?;

        log.lock().unwrap().push(format!("{} {}", method, path));
        let (status, body) = route(&method, &path);
        let response = format!(
            "HTTP/1.1 {} Scripted\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        reader.get_mut().write_all(response.as_bytes()).await?;
    }
}

fn group() -> GroupId {
    GroupId::new(GroupKind::Cluster, GroupName::new("demo").unwrap())
}

fn tags(node_seq_high: NodeNo) -> NodeTags {
    NodeTags {
        kind: GroupKind::Cluster,
        group: group().name,
        owner: "alice".to_string(),
        project: None,
        expires: Expiry::Never,
        features: Features::AEROSPIKE,
        node_seq_high,
        distribution: "ubuntu".to_string(),
        distro_version: "24.04".to_string(),
        aerospike_version: Some("8.0.0.1".to_string()),
        client_type: None,
        arch: Arch::Amd64,
        extra: BTreeMap::new(),
    }
}

/// `GET /containers/json` body listing running nodes of `demo`
fn container_list(nodes: &[NodeNo]) -> String {
    let tags = tags(3);
    let containers: Vec<_> = nodes
        .iter()
        .map(|n| {
            serde_json::json!({
                "Id": format!("id-{}", n),
                "Names": [format!("/fleetlab-demo_{}", n)],
                "Image": "busybox:latest",
                "State": "running",
                "Labels": tags.to_map(*n),
            })
        })
        .collect();
    serde_json::Value::Array(containers).to_string()
}

const SERVER_ERROR: &str = r#"{"message":"engine exploded"}"#;

#[tokio::test]
async fn test_stop_reports_each_failed_node() {
    let listing = container_list(&[1, 2, 3]);
    let engine = Engine::start(move |method, path| {
        if path.contains("/containers/json") {
            (200, listing.clone())
        } else if method == "POST" && path.contains("/containers/fleetlab-demo_2/stop") {
            (500, SERVER_ERROR.to_string())
        } else {
            (200, String::new())
        }
    })
    .await;

    let err = engine
        .backend()
        .stop_group(&group(), &[1, 2, 3])
        .await
        .unwrap_err();

    match &err {
        FleetError::PartialFailure(failure) => {
            assert_eq!(failure.attempted, 3);
            assert_eq!(failure.failed_nodes(), vec![2]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("node 2: "), "{}", err);

    let calls = engine.calls();
    for node in [1, 3] {
        let stop = format!("/containers/fleetlab-demo_{}/stop", node);
        assert!(calls.iter().any(|c| c.contains(&stop)), "{:?}", calls);
    }
}

#[tokio::test]
async fn test_failed_deploy_removes_created_containers() {
    let engine = Engine::start(|method, path| {
        if path.contains("/containers/json") {
            (200, "[]".to_string())
        } else if path.contains("/images/") {
            (200, r#"{"Id":"sha256:1"}"#.to_string())
        } else if path.contains("/containers/create") {
            (201, r#"{"Id":"new","Warnings":[]}"#.to_string())
        } else if method == "POST" && path.contains("/containers/fleetlab-demo_2/start") {
            (500, SERVER_ERROR.to_string())
        } else {
            (200, String::new())
        }
    })
    .await;

    let request = DeployRequest {
        group: group(),
        template: TemplateKey::new("ubuntu", "24.04", "8.0.0.1", Arch::Amd64),
        nodes: vec![1, 2, 3],
        tags: tags(3),
        extra: ProviderExtra::Docker(DockerExtra {
            image: Some("busybox:latest".to_string()),
            ..DockerExtra::default()
        }),
    };
    assert!(engine.backend().deploy_group(&request).await.is_err());

    let calls = engine.calls();
    let removed: Vec<&String> = calls.iter().filter(|c| c.starts_with("DELETE")).collect();
    assert_eq!(removed.len(), 2, "{:?}", calls);
    assert!(removed[0].contains("/containers/fleetlab-demo_1"));
    assert!(removed[1].contains("/containers/fleetlab-demo_2"));
    assert!(!calls.iter().any(|c| c.contains("name=fleetlab-demo_3")));
}

/// Archive as the engine returns it for a single file
fn file_archive(name: &str, contents: &[u8]) -> String {
    let mut data = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut data);
        let mut header = tar::Header::new_gnu();
        header.set_path(name).unwrap();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append(&header, contents).unwrap();
        tar.finish().unwrap();
    }
    String::from_utf8(data).unwrap()
}

#[tokio::test]
async fn test_copy_from_node_extracts_archive() {
    let listing = container_list(&[1, 2]);
    let archive = file_archive("aerospike.log", b"ready");
    let engine = Engine::start(move |method, path| {
        if path.contains("/containers/json") {
            (200, listing.clone())
        } else if method == "GET" && path.contains("/containers/fleetlab-demo_2/archive") {
            (200, archive.clone())
        } else {
            (404, r#"{"message":"no such container"}"#.to_string())
        }
    })
    .await;

    let backend = engine.backend();
    let contents = backend
        .copy_from_node(&group(), 2, "/var/log/aerospike.log")
        .await
        .unwrap();
    assert_eq!(contents, b"ready");

    let err = backend
        .copy_from_node(&group(), 7, "/var/log/aerospike.log")
        .await
        .unwrap_err();
    assert!(err.is_not_found(), "{}", err);
}
