use std::io;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{Receiver, Sender, select};
use tracing::{debug, error, info};

use crate::client::Client;
use crate::completion::CompletionEvent;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::driver::Driver;
use crate::error::Error;
use crate::handler::ClientHandler;
use crate::port::CompletionPort;
use crate::registry::ClientId;

/// Builder for launching a portline engine: a completion backend, the
/// dispatcher worker threads that drain it, and the removal reaper.
pub struct EngineBuilder {
    config: Config,
}

impl EngineBuilder {
    /// Create a new builder with the given config.
    pub fn new(config: Config) -> Self {
        EngineBuilder { config }
    }

    /// Launch with the io_uring backend.
    #[cfg(target_os = "linux")]
    pub fn launch(self) -> Result<Engine, Error> {
        let config = self.config.clone();
        self.launch_with(move |events| {
            crate::port::UringPort::new(&config, events).map(Arc::new)
        })
    }

    /// Launch with any backend. `factory` receives the sender the backend
    /// must report completions through.
    pub fn launch_with<P, F>(self, factory: F) -> Result<Engine, Error>
    where
        P: CompletionPort,
        F: FnOnce(Sender<CompletionEvent>) -> io::Result<Arc<P>>,
    {
        self.config.validate()?;
        let num_threads = if self.config.worker.threads == 0 {
            num_cpus()
        } else {
            self.config.worker.threads
        };

        let (events_tx, events_rx) = crossbeam_channel::unbounded::<CompletionEvent>();
        let port = factory(events_tx).map_err(Error::Setup)?;
        let driver = Driver::new(self.config, port)?;

        // Dropping a stop sender wakes the threads selecting on it.
        let (workers_stop, workers_stopped) = crossbeam_channel::bounded::<()>(0);
        let (reaper_stop, reaper_stopped) = crossbeam_channel::bounded::<()>(0);

        let mut engine = Engine {
            driver: driver.clone(),
            workers: Vec::with_capacity(num_threads),
            workers_stop: Some(workers_stop),
            reaper: None,
            reaper_stop: Some(reaper_stop),
        };

        for worker_id in 0..num_threads {
            let dispatcher = Dispatcher::new(driver.clone());
            let events = events_rx.clone();
            let stop = workers_stopped.clone();
            let handle = thread::Builder::new()
                .name(format!("portline-worker-{worker_id}"))
                .spawn(move || run_worker(worker_id, dispatcher, events, stop))
                .map_err(Error::Io)?;
            engine.workers.push(handle);
        }

        let removals = driver.registry().removals().clone();
        let reaper_driver = driver.clone();
        let reaper = thread::Builder::new()
            .name("portline-removals".to_string())
            .spawn(move || run_removals(reaper_driver, removals, reaper_stopped))
            .map_err(Error::Io)?;
        engine.reaper = Some(reaper);

        info!(workers = num_threads, "engine started");
        Ok(engine)
    }
}

/// A running engine. Shuts down on drop.
pub struct Engine {
    driver: Arc<Driver>,
    workers: Vec<thread::JoinHandle<()>>,
    workers_stop: Option<Sender<()>>,
    reaper: Option<thread::JoinHandle<()>>,
    reaper_stop: Option<Sender<()>>,
}

impl Engine {
    /// Register a new idle client.
    pub fn client(&self, handler: Arc<dyn ClientHandler>) -> Arc<Client> {
        self.driver.new_client(handler)
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Remove every client, waiting for their outstanding completions, then
    /// stop the worker threads and the backend.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.workers_stop.is_none() {
            return;
        }

        // Removals first, while the workers still drain completions.
        drop(self.reaper_stop.take());
        if let Some(handle) = self.reaper.take()
            && handle.join().is_err()
        {
            error!("removal reaper panicked");
        }
        let removed = self.driver.registry().remove_all();
        debug!(removed, "clients removed");

        drop(self.workers_stop.take());
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("completion worker panicked");
            }
        }

        self.driver.port().shutdown();
        info!("engine stopped");
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    worker_id: usize,
    dispatcher: Dispatcher,
    events: Receiver<CompletionEvent>,
    stop: Receiver<()>,
) {
    debug!(worker_id, "completion worker started");
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => dispatcher.dispatch(event),
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
    debug!(worker_id, "completion worker exiting");
}

fn run_removals(driver: Arc<Driver>, removals: Receiver<ClientId>, stop: Receiver<()>) {
    let registry = driver.registry();
    loop {
        select! {
            recv(removals) -> id => match id {
                Ok(id) => {
                    registry.remove(id);
                }
                Err(_) => break,
            },
            recv(stop) -> _ => break,
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
