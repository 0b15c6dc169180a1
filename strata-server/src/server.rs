//! Server assembly: instance bootstrap, executor pool, and the SQL/REST
//! listeners, wired to a shared shutdown flag.

use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};

use strata::crypto::CipherRegistry;
use strata::instance::{Instance, InstanceOptions};

use crate::config::InstanceConfig;
use crate::dispatcher::RequestDispatcher;
use crate::handler::rest::{serve_rest_connection, RestLimits};
use crate::handler::sql::serve_sql_connection;
use crate::handler::spawn_listener;

pub struct Server {
    instance: Arc<Instance>,
    dispatcher: Arc<RequestDispatcher>,
    shutdown: Arc<AtomicBool>,
    sql_addr: SocketAddr,
    rest_addr: SocketAddr,
    listeners: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bootstraps the instance and starts both listeners.
    pub fn start(config: &InstanceConfig) -> Result<Server> {
        let master_key = config.read_master_key()?;
        let options = InstanceOptions {
            data_dir: config.data_dir.clone(),
            master_cipher_id: config.master_cipher_id().to_string(),
            master_key,
            superuser_initial_access_key: config.superuser_initial_access_key.clone(),
            data_area_size: config.data_area_size(),
        };
        let instance = Arc::new(
            Instance::open_or_create(options, Arc::new(CipherRegistry::with_builtin_ciphers()))
                .context("cannot open the instance")?,
        );
        let dispatcher = Arc::new(
            RequestDispatcher::new(config.worker_threads())
                .context("cannot create the executor pool")?,
        );
        let shutdown = Arc::new(AtomicBool::new(false));

        let sql_listener = TcpListener::bind(config.sql_listen_addr())
            .with_context(|| format!("cannot bind SQL listener {}", config.sql_listen_addr()))?;
        let sql_addr = sql_listener.local_addr()?;
        let rest_listener = TcpListener::bind(config.rest_listen_addr())
            .with_context(|| format!("cannot bind REST listener {}", config.rest_listen_addr()))?;
        let rest_addr = rest_listener.local_addr()?;

        let mut listeners = Vec::new();
        {
            let instance = instance.clone();
            let dispatcher = dispatcher.clone();
            listeners.push(spawn_listener(
                "sql",
                sql_listener,
                shutdown.clone(),
                Arc::new(move |stream| {
                    serve_sql_connection(stream, instance.clone(), dispatcher.clone())
                }),
            )?);
        }
        {
            let instance = instance.clone();
            let dispatcher = dispatcher.clone();
            let limits = RestLimits {
                max_rows: config.rest_max_rows(),
                max_payload: config.rest_max_payload(),
            };
            listeners.push(spawn_listener(
                "rest",
                rest_listener,
                shutdown.clone(),
                Arc::new(move |stream| {
                    serve_rest_connection(stream, instance.clone(), dispatcher.clone(), limits)
                }),
            )?);
        }

        log::info!(
            "instance '{}' is up: sql on {}, rest on {}",
            config.instance,
            sql_addr,
            rest_addr
        );
        Ok(Server { instance, dispatcher, shutdown, sql_addr, rest_addr, listeners })
    }

    pub fn instance(&self) -> Arc<Instance> {
        self.instance.clone()
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub fn sql_addr(&self) -> SocketAddr {
        self.sql_addr
    }

    pub fn rest_addr(&self) -> SocketAddr {
        self.rest_addr
    }

    /// Cooperative shutdown: listeners drain on their next accept wake-up,
    /// queued requests resolve as cancelled, dirty data is flushed.
    pub fn stop(mut self) {
        log::info!("shutting down");
        self.shutdown.store(true, Ordering::SeqCst);
        for listener in self.listeners.drain(..) {
            if listener.join().is_err() {
                log::error!("a listener thread panicked during shutdown");
            }
        }
        self.dispatcher.shutdown();
        if let Err(err) = self.instance.flush() {
            log::error!("flush during shutdown failed: {}", err);
        }
    }
}
