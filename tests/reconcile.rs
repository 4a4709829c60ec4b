mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::{closed_port, serve, Reply};
use nextdesk_lib::controller::ControllerClient;
use nextdesk_lib::reconcile::{EngineMode, Mode, Reconciler};
use nextdesk_lib::settings::Settings;

fn engine_stub(configs: &'static str) -> (u16, Arc<AtomicUsize>) {
    let geo_calls = Arc::new(AtomicUsize::new(0));
    let counter = geo_calls.clone();
    let port = serve(move |request| match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/version") => Reply::json(r#"{"version":"v1.18.1","meta":true}"#),
        ("GET", "/configs") => Reply::json(configs),
        ("POST", "/configs/geo") => {
            counter.fetch_add(1, Ordering::SeqCst);
            Reply::status(204)
        }
        _ => Reply::status(404),
    });
    (port, geo_calls)
}

fn settings_for(ports: Vec<u16>) -> Settings {
    Settings {
        control_ports: ports,
        ..Settings::default()
    }
}

#[test]
fn answering_engine_is_reused_with_its_socks_port() {
    let (port, geo_calls) = engine_stub(r#"{"port":7890,"socks-port":7891,"mixed-port":0,"mode":"rule"}"#);
    let mode = Reconciler::new(&settings_for(vec![closed_port(), port])).reconcile();

    assert_eq!(
        mode,
        EngineMode {
            mode: Mode::Reuse,
            control_base: format!("http://127.0.0.1:{port}"),
            socks_port: 7891,
        }
    );

    for _ in 0..40 {
        if geo_calls.load(Ordering::SeqCst) > 0 {
            break;
        }
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(geo_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn mixed_port_is_used_when_socks_is_disabled() {
    let (port, _) = engine_stub(r#"{"socks-port":0,"mixed-port":7897}"#);
    let mode = Reconciler::new(&settings_for(vec![port])).reconcile();
    assert!(mode.is_reuse());
    assert_eq!(mode.socks_port, 7897);
}

#[test]
fn unreadable_configs_fall_back_to_reuse_default() {
    let (port, _) = engine_stub("not json");
    let mode = Reconciler::new(&settings_for(vec![port])).reconcile();
    assert!(mode.is_reuse());
    assert_eq!(mode.socks_port, 7890);
}

#[test]
fn silent_ports_launch_bundled_engine() {
    let settings = settings_for(vec![closed_port(), closed_port()]);
    let mode = Reconciler::new(&settings).reconcile();
    assert_eq!(mode.mode, Mode::Launch);
    assert_eq!(mode.socks_port, 17897);
    assert_eq!(mode.control_base, "http://127.0.0.1:17899");
}

#[test]
fn first_answering_port_in_list_order_wins() {
    let (first, _) = engine_stub(r#"{"socks-port":1081}"#);
    let (second, _) = engine_stub(r#"{"socks-port":1082}"#);
    let mode = Reconciler::new(&settings_for(vec![second, first])).reconcile();
    assert_eq!(mode.socks_port, 1082);
}

#[test]
fn controller_reports_group_delays_and_selects() {
    let port = serve(|request| match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/proxies/Server-HK") => {
            Reply::json(r#"{"name":"Server-HK","type":"Selector","now":"hk-1","all":["hk-1","hk-2"]}"#)
        }
        ("GET", "/proxies/hk-1/delay") if request.query.contains("timeout=") => Reply::json(r#"{"delay":42}"#),
        ("GET", "/proxies/hk-2/delay") => Reply {
            status: 408,
            body: r#"{"message":"Timeout"}"#.to_string(),
        },
        ("PUT", "/proxies/Server-HK") if request.body.contains("hk-2") => Reply::status(204),
        _ => Reply::status(404),
    });
    let client = ControllerClient::new(format!("http://127.0.0.1:{port}"));

    let delays = client.group_delays("Server-HK");
    assert_eq!(delays.get("hk-1"), Some(&42));
    assert_eq!(delays.get("hk-2"), Some(&-1));
    assert!(client.select("Server-HK", "hk-2"));
    assert!(!client.select("Server-HK", "hk-3"));
    assert_eq!(client.proxy("Server-HK").and_then(|info| info.now).as_deref(), Some("hk-1"));
}
