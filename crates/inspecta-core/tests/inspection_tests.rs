//! End-to-end tests: plugins discovered from manifests, dispatched through
//! the registry, with the 3-D engine talking to an in-process simulated host.

use inspecta_core::dispatch::{DispatchJob, EngineDispatcher, InspectionReport};
use inspecta_core::ipc::{ThreeDIpcChannel, ThreeDIpcServer, ThreeDIpcServerHandle};
use inspecta_core::three_d::{SimulatedSdk, ThreeDHost, ThreeDHostService};
use inspecta_core::{
    AlgorithmInput, CancellationToken, EngineFactorySet, EngineRegistry, ExecutionStatus,
    PluginLoader,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const PACK: &str = r#"{
    "id": "line-3",
    "version": "2.0.0",
    "engines": [
        { "id": "VM", "kind": "legacy-vm" },
        { "id": "OpenCV", "kind": "gray-level", "settings": { "darkThreshold": 64 } },
        { "id": "3D", "kind": "three-d", "settings": { "timeoutMs": 300 } }
    ]
}"#;

struct Fixture {
    dir: TempDir,
    host: Arc<ThreeDHost>,
    dispatcher: EngineDispatcher,
    server: Option<ThreeDIpcServerHandle>,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let plugins = dir.path().join("plugins");
        std::fs::create_dir_all(&plugins).unwrap();
        std::fs::write(plugins.join("line-3.json"), PACK).unwrap();
        std::fs::write(plugins.join("broken.json"), "{ \"id\": ").unwrap();

        let host = Arc::new(ThreeDHost::new());
        let loader = PluginLoader::new(EngineFactorySet::builtin(
            host.clone(),
            Duration::from_secs(5),
        ));
        let discovery = loader.discover(&plugins);
        assert_eq!(discovery.plugins.len(), 3, "{:?}", discovery.error_messages());
        assert_eq!(discovery.errors.len(), 1);

        let registry = Arc::new(EngineRegistry::new());
        discovery.register_into(&registry);

        Self {
            dir,
            host,
            dispatcher: EngineDispatcher::new(registry),
            server: None,
        }
    }

    async fn start_simulated_host(&mut self, sdk: SimulatedSdk) {
        let service = Arc::new(ThreeDHostService::new(sdk));
        assert!(service.initialize().await);
        let server = ThreeDIpcServer::start(service).await.unwrap();
        let channel = ThreeDIpcChannel::connect(server.addr()).await.unwrap();
        self.host.attach(channel);
        self.server = Some(server);
    }

    fn images(&self) -> AlgorithmInput {
        let height = self.dir.path().join("h.png");
        let gray = self.dir.path().join("g.png");
        image::GrayImage::from_pixel(8, 8, image::Luma([200u8]))
            .save(&gray)
            .unwrap();
        std::fs::write(&height, b"height").unwrap();
        AlgorithmInput::new("Housing")
            .with_ids("LOT-7", "0001")
            .with_image("Height", height.to_string_lossy())
            .with_image("Gray", gray.to_string_lossy())
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        if let Some(server) = self.server.as_mut() {
            server.shutdown();
        }
    }
}

#[tokio::test]
async fn test_three_d_success_against_simulated_host() {
    let mut fixture = Fixture::new();
    fixture
        .start_simulated_host(SimulatedSdk::new().with_measurement("Gap", 0.12))
        .await;
    let input = fixture
        .images()
        .with_param("Gap.Lower", "0.1")
        .with_param("Gap.Upper", "0.2");

    let result = fixture
        .dispatcher
        .dispatch("3D", &input, &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::Success);
    assert!(result.is_ok());
    assert_eq!(result.measurements().len(), 1);
    assert_eq!(result.measurements()[0].name(), "Gap");
    assert!(!result.measurements()[0].is_out_of_range());
    assert_eq!(result.engine_id, "3D");
    assert_eq!(result.engine_version, "2.0.0");
}

#[tokio::test]
async fn test_unregistered_engine_is_not_available() {
    let fixture = Fixture::new();
    let result = fixture
        .dispatcher
        .dispatch("Onnx", &fixture.images(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::NotAvailable);
    assert_eq!(result.engine_id, "Onnx");
    assert!(result.measurements().is_empty());
}

#[tokio::test]
async fn test_host_not_running_short_circuits() {
    let fixture = Fixture::new();
    let plugin = fixture.dispatcher.registry().get("3D").unwrap();
    assert!(!plugin.engine().is_available());

    let started = Instant::now();
    let result = fixture
        .dispatcher
        .dispatch("3D", &fixture.images(), &CancellationToken::new())
        .await;

    assert_eq!(result.status, ExecutionStatus::NotAvailable);
    assert!(started.elapsed() < Duration::from_millis(250));
}

#[tokio::test]
async fn test_host_timeout_is_bounded() {
    let mut fixture = Fixture::new();
    fixture.start_simulated_host(SimulatedSdk::new()).await;
    let input = fixture.images().with_param("Simulate.DelayMs", "1000");

    let started = Instant::now();
    let result = fixture
        .dispatcher
        .dispatch("3D", &input, &CancellationToken::new())
        .await;
    let elapsed = started.elapsed();

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(elapsed >= Duration::from_millis(300));
    assert!(elapsed < Duration::from_millis(900), "took {:?}", elapsed);
    assert_eq!(
        result.debug_info.get("failureKind").map(String::as_str),
        Some("Timeout")
    );

    // The channel survives a timeout.
    assert!(fixture.host.is_available());
}

#[tokio::test]
async fn test_concurrent_requests_complete_out_of_order() {
    let mut fixture = Fixture::new();
    fixture.start_simulated_host(SimulatedSdk::new()).await;
    let slow = fixture
        .images()
        .with_ids("LOT-7", "slow")
        .with_param("Simulate.DelayMs", "150")
        .with_param("Simulate.Gap", "0.5");
    let fast = fixture
        .images()
        .with_ids("LOT-7", "fast")
        .with_param("Simulate.Gap", "0.1");
    let cancel = CancellationToken::new();

    let (slow_result, fast_result) = tokio::join!(
        fixture.dispatcher.dispatch("3D", &slow, &cancel),
        fixture.dispatcher.dispatch("3D", &fast, &cancel),
    );

    assert_eq!(slow_result.measurement("Gap").unwrap().value(), 0.5);
    assert_eq!(fast_result.measurement("Gap").unwrap().value(), 0.1);
}

#[tokio::test]
async fn test_mixed_engines_aggregate_into_report() {
    let mut fixture = Fixture::new();
    fixture
        .start_simulated_host(SimulatedSdk::new().with_measurement("Gap", 0.35))
        .await;
    let input = fixture
        .images()
        .with_param("Gap.Upper", "0.2")
        .with_param("MeanGray.Lower", "100");
    let jobs = vec![
        DispatchJob::new("OpenCV", input.clone()),
        DispatchJob::new("3D", input.clone()),
        DispatchJob::new("ONNX", input),
    ];

    let results = fixture
        .dispatcher
        .dispatch_all(&jobs, &CancellationToken::new())
        .await;
    let report = InspectionReport::aggregate(&results);

    assert!(results[0].is_ok());
    assert!(!results[1].is_ok());
    assert_eq!(results[2].status, ExecutionStatus::NotAvailable);
    assert!(!report.is_ok);
    assert_eq!(report.defect_type.as_deref(), Some("Gap"));
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].engine_id, "ONNX");
}

#[tokio::test]
async fn test_cancelled_three_d_call_releases_caller() {
    let mut fixture = Fixture::new();
    fixture.start_simulated_host(SimulatedSdk::new()).await;
    let input = fixture.images().with_param("Simulate.DelayMs", "1000");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = fixture.dispatcher.dispatch("3D", &input, &cancel).await;

    assert_eq!(result.status, ExecutionStatus::Failed);
    assert!(started.elapsed() < Duration::from_millis(290));
    assert!(fixture.host.is_available());
}
