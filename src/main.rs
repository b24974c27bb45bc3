#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::io::Write;
use std::path::Path;

use log::{debug, error};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::runtime::Builder;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::task::JoinHandle;

use shunt::config::{self, Config};
use shunt::proxy;

#[derive(Debug)]
struct ConfigChanged;

fn start_notify_thread(config_path: String) -> (RecommendedWatcher, UnboundedReceiver<ConfigChanged>) {
    let (tx, rx) = unbounded_channel();

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            if matches!(event.kind, EventKind::Modify(..)) {
                tx.send(ConfigChanged {}).unwrap();
            }
        }
        Err(e) => println!("watch error: {e:?}"),
    })
    .unwrap();

    watcher
        .watch(Path::new(&config_path), RecursiveMode::NonRecursive)
        .unwrap();

    (watcher, rx)
}

async fn start_servers(config: Config) -> Vec<JoinHandle<()>> {
    let mut join_handles = Vec::new();
    let settings = config.transports.clone();

    if let Some(relay_config) = config.relay.clone() {
        let settings = settings.clone();
        join_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy::run_relay_server(relay_config, settings).await {
                error!("relay server exited: {e}");
            }
        }));
    }

    for proxy_config in config.http_proxies.iter().cloned() {
        let settings = settings.clone();
        join_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy::run_http_proxy(proxy_config, settings).await {
                error!("http proxy exited: {e}");
            }
        }));
    }

    for proxy_config in config.direct_proxies.iter().cloned() {
        let settings = settings.clone();
        join_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy::run_direct_proxy(proxy_config, settings).await {
                error!("direct proxy exited: {e}");
            }
        }));
    }

    if let Some(transparent_config) = config.transparent.clone() {
        join_handles.push(tokio::spawn(async move {
            if let Err(e) = proxy::run_transparent_proxy(transparent_config, settings).await {
                error!("transparent proxy exited: {e}");
            }
        }));
    }

    join_handles
}

fn print_usage_and_exit(arg0: String) {
    eprintln!("Usage: {arg0} [--threads/-t N] [--dry-run/-d] [--no-reload] <config filename>");
    std::process::exit(1);
}

fn main() {
    env_logger::builder()
        .format(|buf, record| {
            let timestamp = buf.timestamp();
            let level_style = buf.default_level_style(record.level());
            // Proxies log peer-controlled bytes; keep them printable.
            let sanitized_args = format!("{}", record.args())
                .chars()
                .map(|c| {
                    if c.is_ascii_graphic() || c == ' ' {
                        c
                    } else {
                        '?'
                    }
                })
                .collect::<String>();

            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}] {}",
                timestamp,
                record.level(),
                record.target(),
                sanitized_args
            )
        })
        .init();

    let mut args: Vec<String> = std::env::args().collect();
    let arg0 = args.remove(0);
    let mut num_threads = 0usize;
    let mut dry_run = false;
    let mut no_reload = false;

    while !args.is_empty() && args[0].starts_with("-") {
        if args[0] == "--threads" || args[0] == "-t" {
            args.remove(0);
            if args.is_empty() {
                eprintln!("Missing threads argument.");
                print_usage_and_exit(arg0);
                return;
            }
            num_threads = match args.remove(0).parse::<usize>() {
                Ok(n) => n,
                Err(e) => {
                    eprintln!("Invalid thread count: {e}");
                    print_usage_and_exit(arg0);
                    return;
                }
            };
        } else if args[0] == "--dry-run" || args[0] == "-d" {
            args.remove(0);
            dry_run = true;
        } else if args[0] == "--no-reload" {
            args.remove(0);
            no_reload = true;
        } else {
            eprintln!("Invalid argument: {}", args[0]);
            print_usage_and_exit(arg0);
            return;
        }
    }

    if args.is_empty() {
        println!("No config specified, assuming loading from file config.shunt.yaml");
        args.push("config.shunt.yaml".to_string());
    }
    let config_path = args.remove(0);

    if dry_run {
        println!("Starting dry run.");
    }

    if num_threads == 0 {
        num_threads = std::cmp::max(
            2,
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        );
        debug!("Runtime threads: {num_threads}");
    } else {
        println!("Using custom thread count ({num_threads})");
    }

    let mut builder = if num_threads == 1 {
        Builder::new_current_thread()
    } else {
        let mut mt = Builder::new_multi_thread();
        mt.worker_threads(num_threads);
        mt
    };

    let runtime = builder
        .enable_io()
        .enable_time()
        .build()
        .expect("Could not build tokio runtime");

    runtime.block_on(async move {
        let mut reload_state = if no_reload {
            None
        } else {
            let (watcher, rx) = start_notify_thread(config_path.clone());
            Some((watcher, rx))
        };

        loop {
            let config = match config::load_config(&config_path).await {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("Failed to load config: {e}\n");
                    print_usage_and_exit(arg0);
                    return;
                }
            };

            debug!("{config:#?}");

            if dry_run {
                println!("Finishing dry run, config parsed successfully.");
                return;
            }

            let join_handles = start_servers(config).await;

            match reload_state.as_mut() {
                Some((_watcher, rx)) => {
                    // Wait for config change
                    rx.recv().await.unwrap();

                    println!("Config changed, restarting servers in 3 seconds..");

                    for join_handle in join_handles {
                        join_handle.abort();
                    }

                    tokio::time::sleep(std::time::Duration::from_secs(3)).await;

                    // Remove any extra events
                    while rx.try_recv().is_ok() {}
                }
                None => {
                    // No reload mode - wait forever
                    futures::future::pending::<()>().await;
                    unreachable!();
                }
            }
        }
    });
}
