//! Orchestrator for cluster-wide tasks.
//!
//! `ProcessCommander` owns the task queue, the per-host work map, the error
//! log and every result destination. It runs a single event loop over a
//! channel of `CommanderEvent`s fed by the listener, the connection threads
//! and the worker-process threads; nothing else touches its state.
//!
//! # Run cycle
//!
//! 1. Bind the listener (first run only) and start accepting
//! 2. Spawn one worker per host (first run only)
//! 3. Start the first queued task: fill the work map, drop hosts whose
//!    worker is gone, hand work to idle connections
//! 4. Consume events until every task is done: each connection that is
//!    ready gets the next shard of its host; results are merged by the
//!    task and shard recorded when the request was sent
//! 5. Park or stop the connections and stop accepting
//!
//! Node failures (error responses, lost connections, failed workers) are
//! logged and the task carries on with the remaining nodes. Merge and grid
//! errors stop dispatching; `run` returns them once in-flight requests have
//! settled.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{mpsc, Arc};

use super::connection::{ConnectionCommand, ConnectionSettings, Request, ResponsePayload};
use super::event::{CommanderEvent, ConnectionId, EventSender};
use super::process::{CoordinatorAddress, ExitReport, RemoteProcess, SshLauncher, WorkerLauncher};
use super::server::Server;
use super::timerange::ObservationTimerange;
use crate::config::ClusterSettings;
use crate::error::{ClusterError, ErrorLog};
use crate::observation::{ClusterItem, ClusteredObservation, NodeCommandMap};
use crate::payload::{
    Accumulator, AntennaInfo, BandInfo, HistogramCollection, QualityTables, RowData, StatisticsCollection,
};


/// One cluster-wide phase. Every shard of the observation is visited once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    ReadQualityTables { correct_histograms: bool },
    ReadAntennaTables,
    ReadBandTables,
    ReadDataRows { start_row: u64, row_count: u64 },
    WriteDataRows { start_row: u64, row_count: u64 },
}


struct ConnectionEntry {
    peer: SocketAddr,
    commands: mpsc::Sender<ConnectionCommand>,
    socket: TcpStream,
    /// Known once the handshake is done.
    hostname: Option<String>,
    in_flight: Option<(Task, ClusterItem)>,
    idle: bool,
}


pub struct ProcessCommander {
    observation: ClusteredObservation,
    settings: ClusterSettings,
    launcher: Arc<dyn WorkerLauncher>,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<CommanderEvent>,
    server: Option<Server>,
    processes: Vec<RemoteProcess>,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    node_map: NodeCommandMap,
    tasks: VecDeque<Task>,
    current: Option<Task>,
    /// Hosts whose worker has exited or whose connection failed.
    lost_hosts: BTreeSet<String>,
    errors: ErrorLog,
    fatal: Option<ClusterError>,

    statistics: Option<StatisticsCollection>,
    histograms: Option<HistogramCollection>,
    antennas: Vec<Option<Vec<AntennaInfo>>>,
    bands: Vec<Option<BandInfo>>,
    rows: Vec<Vec<RowData>>,
    timerange: Option<ObservationTimerange>,
}

impl ProcessCommander {
    /// Commander that starts workers over ssh.
    pub fn new(observation: ClusteredObservation, settings: ClusterSettings) -> ProcessCommander {
        let launcher = Arc::new(SshLauncher::from_settings(&settings));
        Self::with_launcher(observation, settings, launcher)
    }

    pub fn with_launcher(
        observation: ClusteredObservation,
        settings: ClusterSettings,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> ProcessCommander {
        let (events_tx, events_rx) = mpsc::channel();
        let shard_count = observation.len();
        ProcessCommander {
            observation,
            settings,
            launcher,
            events_tx,
            events_rx,
            server: None,
            processes: Vec::new(),
            connections: HashMap::new(),
            node_map: NodeCommandMap::new(),
            tasks: VecDeque::new(),
            current: None,
            lost_hosts: BTreeSet::new(),
            errors: ErrorLog::new(),
            fatal: None,
            statistics: None,
            histograms: None,
            antennas: vec![None; shard_count],
            bands: vec![None; shard_count],
            rows: vec![Vec::new(); shard_count],
            timerange: None,
        }
    }

    pub fn observation(&self) -> &ClusteredObservation {
        &self.observation
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Address the listener is bound to, once the first run has started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(|s| s.local_addr().ok())
    }

    pub fn pending_tasks(&self) -> usize {
        self.tasks.len()
    }

    // -----------------------------------------------------------------------
    // Task queue
    // -----------------------------------------------------------------------

    /// Queue a quality-table read. Results replace those of earlier runs.
    pub fn push_read_quality_tables_task(&mut self, correct_histograms: bool) {
        self.statistics = None;
        self.histograms = None;
        self.tasks.push_back(Task::ReadQualityTables { correct_histograms });
    }

    pub fn push_read_antenna_tables_task(&mut self) {
        self.antennas.iter_mut().for_each(|a| *a = None);
        self.tasks.push_back(Task::ReadAntennaTables);
    }

    pub fn push_read_band_tables_task(&mut self) {
        self.bands.iter_mut().for_each(|b| *b = None);
        self.tasks.push_back(Task::ReadBandTables);
    }

    /// Queue a row read into the timerange. Rows land in the timestep given
    /// by their `time_offset_index`.
    pub fn push_read_data_rows_task(&mut self, start_row: u64, row_count: u64) -> Result<(), ClusterError> {
        self.require_timerange()?;
        self.tasks.push_back(Task::ReadDataRows { start_row, row_count });
        Ok(())
    }

    /// Queue writing the timerange back into the rows last read from each
    /// shard.
    pub fn push_write_data_rows_task(&mut self, start_row: u64, row_count: u64) -> Result<(), ClusterError> {
        self.require_timerange()?;
        self.tasks.push_back(Task::WriteDataRows { start_row, row_count });
        Ok(())
    }

    fn require_timerange(&self) -> Result<(), ClusterError> {
        match &self.timerange {
            Some(tr) if tr.is_initialized() => Ok(()),
            _ => Err(ClusterError::TimerangeNotInitialized),
        }
    }

    /// Build the global channel grid from the bands read so far.
    pub fn initialize_timerange(&mut self, polarization_count: usize, timestep_count: usize) -> Result<(), ClusterError> {
        let mut timerange = ObservationTimerange::new(self.observation.len());
        for (node, band) in self.bands.iter().enumerate() {
            if let Some(band) = band {
                timerange.set_band(node, band.clone())?;
            }
        }
        timerange.initialize(polarization_count, timestep_count)?;
        log::info!(
            "timerange initialized: {} channels, {} timesteps",
            timerange.channel_count(),
            timerange.timestep_count()
        );
        self.timerange = Some(timerange);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Destinations
    // -----------------------------------------------------------------------

    pub fn statistics(&self) -> Option<&StatisticsCollection> {
        self.statistics.as_ref()
    }

    pub fn histograms(&self) -> Option<&HistogramCollection> {
        self.histograms.as_ref()
    }

    /// Antennas of all shards, first occurrence of each id, in shard order.
    pub fn antennas(&self) -> Vec<AntennaInfo> {
        let mut seen = BTreeSet::new();
        let mut union = Vec::new();
        for antenna in self.antennas.iter().flatten().flatten() {
            if seen.insert(antenna.id) {
                union.push(antenna.clone());
            }
        }
        union
    }

    pub fn band(&self, node: usize) -> Option<&BandInfo> {
        self.bands.get(node).and_then(|b| b.as_ref())
    }

    pub fn timerange(&self) -> Option<&ObservationTimerange> {
        self.timerange.as_ref()
    }

    pub fn timerange_mut(&mut self) -> Option<&mut ObservationTimerange> {
        self.timerange.as_mut()
    }

    /// Rows last read from shard `node`.
    pub fn rows(&self, node: usize) -> &[RowData] {
        self.rows.get(node).map(|r| r.as_slice()).unwrap_or(&[])
    }

    // -----------------------------------------------------------------------
    // Errors
    // -----------------------------------------------------------------------

    pub fn errors(&self) -> &[String] {
        self.errors.entries()
    }

    pub fn error_string(&self) -> String {
        self.errors.summary(self.settings.max_reported_errors)
    }

    /// `Err` summarizing every node error of the last run, if there were any.
    pub fn check_errors(&self) -> Result<(), ClusterError> {
        if self.errors.is_empty() {
            return Ok(());
        }
        Err(ClusterError::Remote {
            count: self.errors.len(),
            summary: self.error_string(),
        })
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    /// Execute every queued task. With `finish_connections` the workers are
    /// told to stop afterwards; otherwise their connections stay open for
    /// the next run.
    pub fn run(&mut self, finish_connections: bool) -> Result<(), ClusterError> {
        self.errors.clear();
        self.fatal = None;
        if self.tasks.is_empty() {
            return Ok(());
        }

        // The queue stays intact until the listener is up and workers exist.
        self.ensure_server()?;
        if self.processes.is_empty() {
            self.spawn_processes()?;
        }
        if let Some(first) = self.tasks.pop_front() {
            self.begin_task(first);
        }
        self.advance();

        while self.current.is_some() {
            match self.events_rx.recv() {
                Ok(event) => self.handle_event(event),
                Err(_) => {
                    self.fail(ClusterError::ChannelClosed);
                    break;
                }
            }
            self.advance();
        }

        self.finish(finish_connections);
        match self.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_server(&mut self) -> Result<(), ClusterError> {
        if self.server.is_none() {
            let settings = ConnectionSettings {
                handshake_timeout: self.settings.handshake_timeout(),
                request_timeout: self.settings.request_timeout(),
            };
            let server = Server::bind(&self.settings.bind_address, self.settings.port, settings)
                .map_err(ClusterError::Listener)?;
            self.server = Some(server);
        }
        if let Some(server) = &mut self.server {
            server.start(self.events_tx.clone()).map_err(ClusterError::Listener)?;
        }
        Ok(())
    }

    fn spawn_processes(&mut self) -> Result<(), ClusterError> {
        let port = match &self.server {
            Some(server) => server.local_addr().map_err(ClusterError::Listener)?.port(),
            None => self.settings.port,
        };
        let coordinator = CoordinatorAddress {
            host: self.settings.coordinator_host(),
            port,
        };
        for hostname in self.observation.hostnames() {
            let mut process = RemoteProcess::new(&hostname, coordinator.clone(), Arc::clone(&self.launcher));
            process.start(self.events_tx.clone())?;
            self.processes.push(process);
        }
        log::info!("started {} worker(s), coordinator at {}:{}", self.processes.len(), coordinator.host, port);
        Ok(())
    }

    fn begin_task(&mut self, task: Task) {
        log::info!("starting task {:?}", task);
        self.node_map.initialize(&self.observation);
        let lost: Vec<String> = self.lost_hosts.iter().cloned().collect();
        for host in lost {
            if self.node_map.remove_node(&host) {
                self.errors.push(format!("{}: worker is no longer running", host));
            }
        }
        if let Task::ReadDataRows { .. } = task {
            if let Some(tr) = &mut self.timerange {
                tr.set_zero();
            }
            self.rows.iter_mut().for_each(|r| r.clear());
        }
        self.current = Some(task);

        let idle: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, e)| e.idle && e.hostname.is_some())
            .map(|(id, _)| *id)
            .collect();
        for id in idle {
            self.dispatch(id);
        }
    }

    /// Finish the current task when no work is queued or in flight, and
    /// start the next one.
    fn advance(&mut self) {
        while let Some(task) = self.current {
            let in_flight = self.connections.values().any(|e| e.in_flight.is_some());
            if !self.node_map.is_empty() || in_flight {
                return;
            }
            log::info!("task {:?} complete", task);
            self.current = None;
            if let Some(next) = self.tasks.pop_front() {
                self.begin_task(next);
            }
        }
    }

    fn finish(&mut self, finish_connections: bool) {
        if finish_connections {
            let ids: Vec<ConnectionId> = self
                .connections
                .iter()
                .filter(|(_, e)| e.in_flight.is_none())
                .map(|(id, _)| *id)
                .collect();
            for id in ids {
                if let Some(entry) = self.connections.remove(&id) {
                    let _ = entry.commands.send(ConnectionCommand::Stop);
                }
            }
        }
        if let Some(server) = &mut self.server {
            server.stop();
        }
        log::info!("run finished with {} node error(s)", self.errors.len());
    }

    fn fail(&mut self, error: ClusterError) {
        if self.fatal.is_some() {
            return;
        }
        log::error!("{}", error);
        self.fatal = Some(error);
        self.tasks.clear();
        self.node_map = NodeCommandMap::new();
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn handle_event(&mut self, event: CommanderEvent) {
        match event {
            CommanderEvent::ConnectionCreated { id, peer, commands, socket } => {
                self.connections.insert(
                    id,
                    ConnectionEntry {
                        peer,
                        commands,
                        socket,
                        hostname: None,
                        in_flight: None,
                        idle: false,
                    },
                );
            }
            CommanderEvent::AwaitingCommand { id, hostname } => {
                if let Some(entry) = self.connections.get_mut(&id) {
                    entry.hostname = Some(hostname);
                    entry.in_flight = None;
                    self.dispatch(id);
                }
            }
            CommanderEvent::Finished { id, hostname, payload } => {
                let Some((task, item)) = self.take_in_flight(id) else {
                    log::warn!("unexpected result from {} on connection {}", hostname, id);
                    return;
                };
                self.merge(task, &item, payload);
            }
            CommanderEvent::RemoteError { id, hostname, code, message } => {
                let context = match self.take_in_flight(id) {
                    Some((_, item)) => format!("{}: {}", hostname, item.local_path),
                    None => hostname,
                };
                self.errors.push(format!("{}: {}: {}", context, code, message));
            }
            CommanderEvent::ConnectionFailed { id, hostname, error } => {
                self.connection_failed(id, hostname, &error);
            }
            CommanderEvent::ProcessFinished { hostname, outcome } => {
                self.process_finished(hostname, outcome);
            }
            CommanderEvent::ListenerFailed { error } => {
                self.fail(ClusterError::Listener(std::io::Error::new(std::io::ErrorKind::Other, error)));
            }
        }
    }

    fn take_in_flight(&mut self, id: ConnectionId) -> Option<(Task, ClusterItem)> {
        self.connections.get_mut(&id).and_then(|e| e.in_flight.take())
    }

    fn connection_failed(&mut self, id: ConnectionId, hostname: Option<String>, error: &str) {
        let entry = self.connections.remove(&id);
        let hostname = hostname.or_else(|| entry.as_ref().and_then(|e| e.hostname.clone()));
        let context = match (&entry, &hostname) {
            (Some(ConnectionEntry { in_flight: Some((_, item)), .. }), _) => {
                format!("{}: {}", item.hostname, item.local_path)
            }
            (_, Some(host)) => host.clone(),
            (Some(entry), None) => format!("connection from {}", entry.peer),
            (None, None) => format!("connection {}", id),
        };
        self.errors.push(format!("{}: connection failed: {}", context, error));
        if let Some(host) = hostname {
            self.node_map.remove_node(&host);
            self.lost_hosts.insert(host);
        }
    }

    fn process_finished(&mut self, hostname: String, outcome: Result<ExitReport, String>) {
        let had_work = self.node_map.contains(&hostname);
        let context = match self.node_map.current(&hostname) {
            Some(item) => format!("{}: {}", hostname, item.local_path),
            None => hostname.clone(),
        };
        self.node_map.remove_node(&hostname);
        match outcome {
            Err(e) => self.errors.push(format!("{}: worker could not be started: {}", context, e)),
            Ok(report) if report.failed() => {
                self.errors.push(format!("{}: worker exited with {}", context, report))
            }
            Ok(_) if had_work => {
                self.errors.push(format!("{}: worker exited before finishing its work", context))
            }
            Ok(_) => log::debug!("worker on {} exited", hostname),
        }
        self.lost_hosts.insert(hostname);
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Give connection `id` the next shard of its host, or park it.
    fn dispatch(&mut self, id: ConnectionId) {
        let task = match self.current {
            Some(task) if self.fatal.is_none() => task,
            _ => return self.park(id),
        };
        let Some(hostname) = self.connections.get(&id).and_then(|e| e.hostname.clone()) else {
            return;
        };
        loop {
            let Some(item) = self.node_map.pop(&hostname) else {
                return self.park(id);
            };
            let request = match self.request_for(task, &item) {
                Ok(Some(request)) => request,
                Ok(None) => continue,
                Err(e) => {
                    self.fail(e);
                    return self.park(id);
                }
            };
            let Some(entry) = self.connections.get_mut(&id) else {
                return;
            };
            log::debug!("{}: {:?} on {}", hostname, task, item.local_path);
            entry.idle = false;
            entry.in_flight = Some((task, item));
            if entry.commands.send(ConnectionCommand::Execute(request)).is_err() {
                self.connection_failed(id, Some(hostname), "connection thread has exited");
            }
            return;
        }
    }

    fn park(&mut self, id: ConnectionId) {
        if let Some(entry) = self.connections.get_mut(&id) {
            entry.idle = true;
        }
    }

    /// `Ok(None)` when the shard has nothing to do for this task; the reason
    /// is logged as a node error.
    fn request_for(&mut self, task: Task, item: &ClusterItem) -> Result<Option<Request>, ClusterError> {
        let path = item.local_path.clone();
        Ok(Some(match task {
            Task::ReadQualityTables { correct_histograms } => Request::ReadQualityTables { path, correct_histograms },
            Task::ReadAntennaTables => Request::ReadAntennaTables { path },
            Task::ReadBandTables => Request::ReadBandTable { path },
            Task::ReadDataRows { start_row, row_count } => Request::ReadDataRows { path, start_row, row_count },
            Task::WriteDataRows { start_row, row_count } => {
                let read = self.rows.get(item.index).map(|r| r.as_slice()).unwrap_or(&[]);
                if read.is_empty() {
                    self.errors.push(format!("{}: {}: no rows were read to write back", item.hostname, path));
                    return Ok(None);
                }
                let mut rows: Vec<RowData> = read.iter().take(row_count as usize).cloned().collect();
                let timerange = self.timerange.as_ref().ok_or(ClusterError::TimerangeNotInitialized)?;
                timerange.get_timestep_data(item.index, &mut rows)?;
                Request::WriteDataRows { path, start_row, rows }
            }
        }))
    }

    // -----------------------------------------------------------------------
    // Merging
    // -----------------------------------------------------------------------

    fn merge(&mut self, task: Task, item: &ClusterItem, payload: ResponsePayload) {
        if self.fatal.is_some() {
            return;
        }
        let result = match (task, payload) {
            (Task::ReadQualityTables { .. }, ResponsePayload::QualityTables(tables)) => self.merge_quality(tables),
            (Task::ReadAntennaTables, ResponsePayload::Antennas(list)) => {
                self.antennas[item.index] = Some(list);
                Ok(())
            }
            (Task::ReadBandTables, ResponsePayload::Band(band)) => {
                self.bands[item.index] = Some(band);
                Ok(())
            }
            (Task::ReadDataRows { .. }, ResponsePayload::Rows(rows)) => self.place_rows(item, rows),
            (Task::WriteDataRows { .. }, ResponsePayload::Written) => {
                log::debug!("{}: rows written to {}", item.hostname, item.local_path);
                Ok(())
            }
            (task, _) => {
                self.errors.push(format!(
                    "{}: {}: response does not match task {:?}",
                    item.hostname, item.local_path, task
                ));
                Ok(())
            }
        };
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Rows are kept for write-back only once they are in the grid.
    fn place_rows(&mut self, item: &ClusterItem, rows: Vec<RowData>) -> Result<(), ClusterError> {
        let timerange = self.timerange.as_mut().ok_or(ClusterError::TimerangeNotInitialized)?;
        timerange.set_timestep_data(item.index, &rows)?;
        self.rows[item.index] = rows;
        Ok(())
    }

    fn merge_quality(&mut self, tables: QualityTables) -> Result<(), ClusterError> {
        tables.validate()?;
        match &mut self.statistics {
            Some(total) => total.merge(&tables.statistics)?,
            None => self.statistics = Some(tables.statistics),
        }
        match &mut self.histograms {
            Some(total) => total.merge(&tables.histograms)?,
            None => self.histograms = Some(tables.histograms),
        }
        Ok(())
    }
}

impl Drop for ProcessCommander {
    fn drop(&mut self) {
        if let Some(server) = &mut self.server {
            server.stop();
        }
        // Connections accepted but not yet seen by the event loop.
        while let Ok(event) = self.events_rx.try_recv() {
            if let CommanderEvent::ConnectionCreated { .. } = event {
                self.handle_event(event);
            }
        }
        for (_, entry) in self.connections.drain() {
            if entry.in_flight.is_some() || entry.hostname.is_none() {
                let _ = entry.socket.shutdown(Shutdown::Both);
            }
            let _ = entry.commands.send(ConnectionCommand::Stop);
        }
        if let Some(server) = &self.server {
            server.join_connections();
        }
        self.processes.clear();
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex32;

    use std::io::Read;

    use crate::remote::client::Client;
    use crate::remote::format::{InitialBlock, InitialResponse};
    use crate::store::memory::{MemoryShard, MemoryStore};

    const MHZ: f64 = 1e6;

    /// Runs each host's worker as a `Client` in the launcher thread.
    struct InProcessLauncher {
        stores: HashMap<String, Arc<MemoryStore>>,
        /// Hosts whose worker exits with this code without connecting.
        broken: HashMap<String, i32>,
        /// Hosts whose worker completes the handshake and then never answers.
        silent: Vec<String>,
    }

    impl InProcessLauncher {
        fn new() -> InProcessLauncher {
            InProcessLauncher { stores: HashMap::new(), broken: HashMap::new(), silent: Vec::new() }
        }

        fn host(mut self, hostname: &str, store: Arc<MemoryStore>) -> Self {
            self.stores.insert(hostname.to_string(), store);
            self
        }

        fn broken(mut self, hostname: &str, code: i32) -> Self {
            self.broken.insert(hostname.to_string(), code);
            self
        }

        fn silent(mut self, hostname: &str) -> Self {
            self.silent.push(hostname.to_string());
            self
        }
    }

    /// Handshake, then swallow everything until the coordinator hangs up.
    fn run_silent_worker(hostname: &str, coordinator: &CoordinatorAddress) -> Result<ExitReport, String> {
        let mut stream =
            TcpStream::connect((coordinator.host.as_str(), coordinator.port)).map_err(|e| e.to_string())?;
        InitialBlock::read_from(&mut stream).map_err(|e| e.to_string())?;
        InitialResponse::accept(hostname).write_to(&mut stream).map_err(|e| e.to_string())?;
        let mut rest = Vec::new();
        let _ = stream.read_to_end(&mut rest);
        Ok(ExitReport::with_code(1))
    }

    impl WorkerLauncher for InProcessLauncher {
        fn launch(&self, hostname: &str, coordinator: &CoordinatorAddress) -> Result<ExitReport, String> {
            if let Some(code) = self.broken.get(hostname) {
                return Ok(ExitReport::with_code(*code));
            }
            if self.silent.iter().any(|h| h == hostname) {
                return run_silent_worker(hostname, coordinator);
            }
            let store = self.stores.get(hostname).cloned().ok_or("unknown host")?;
            let mut client = Client::connect(&coordinator.host, coordinator.port, store, hostname)
                .map_err(|e| e.to_string())?;
            match client.run() {
                Ok(()) => Ok(ExitReport::success()),
                Err(_) => Ok(ExitReport::with_code(1)),
            }
        }
    }

    fn settings() -> ClusterSettings {
        ClusterSettings {
            port: 0,
            bind_address: "127.0.0.1".into(),
            coordinator_host: Some("127.0.0.1".into()),
            handshake_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            ..ClusterSettings::default()
        }
    }

    fn observation(items: &[(&str, &str)]) -> ClusteredObservation {
        let mut obs = ClusteredObservation::new();
        for (path, host) in items {
            obs.add_item(path, host);
        }
        obs
    }

    fn quality(pol: usize, antenna: u32, value: f64) -> QualityTables {
        let mut q = QualityTables::new(pol);
        q.statistics.baseline_mut(antenna, antenna + 1).add_value(0, value, 0.0, false);
        q.statistics.timestep_mut(1000).add_value(0, value, value, true);
        q.histograms.add_amplitude(0, value, false);
        q
    }

    fn rows(offset: usize, count: usize, channels: usize, value: f32) -> Vec<RowData> {
        (0..count)
            .map(|i| {
                let mut r = RowData::new(1, channels);
                r.time_offset_index = offset + i;
                r.antenna1 = 0;
                r.antenna2 = 1;
                r.time = (offset + i) as f64;
                for c in 0..channels {
                    r.set_sample(c, 0, Complex32::new(value, c as f32));
                }
                r
            })
            .collect()
    }

    fn shard(
        antennas: &[(u32, &str)],
        band_mhz: &[f64],
        rows: Vec<RowData>,
        quality: Option<QualityTables>,
    ) -> MemoryShard {
        let hz: Vec<f64> = band_mhz.iter().map(|f| f * MHZ).collect();
        MemoryShard {
            antennas: Some(antennas.iter().map(|(id, name)| AntennaInfo::new(*id, name, name)).collect()),
            band: Some(BandInfo::from_frequencies(0, &hz)),
            quality,
            rows: Some(rows),
        }
    }

    fn store(path: &str, shard: MemoryShard) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert(path, shard);
        store
    }

    #[test]
    fn antennas_bands_then_rows_across_two_nodes() {
        let s1 = store(
            "/data/sb0.ms",
            shard(&[(0, "CS001"), (1, "CS002")], &[100.0, 101.0, 102.0], rows(0, 10, 3, 1.0), None),
        );
        let s2 = store(
            "/data/sb1.ms",
            shard(&[(1, "CS002"), (2, "CS003")], &[103.0, 104.0, 105.0], rows(10, 10, 3, 2.0), None),
        );
        let launcher = InProcessLauncher::new().host("node-1", s1).host("node-2", s2);
        let obs = observation(&[("/data/sb0.ms", "node-1"), ("/data/sb1.ms", "node-2")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_antenna_tables_task();
        cmd.push_read_band_tables_task();
        cmd.run(false).unwrap();
        cmd.check_errors().unwrap();
        let ids: Vec<u32> = cmd.antennas().iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(cmd.band(1).unwrap().channel_count(), 3);

        cmd.initialize_timerange(1, 20).unwrap();
        assert_eq!(cmd.timerange().unwrap().channel_count(), 6);
        cmd.push_read_data_rows_task(0, 10).unwrap();
        cmd.run(true).unwrap();
        cmd.check_errors().unwrap();

        let tr = cmd.timerange().unwrap();
        assert_eq!(tr.timestep_count(), 20);
        assert!(tr.unfilled_timesteps().is_empty());
        assert_eq!(tr.sample(3, 1, 0), Complex32::new(1.0, 1.0));
        assert_eq!(tr.sample(15, 4, 0), Complex32::new(2.0, 1.0));
        assert_eq!(tr.sample(15, 1, 0), Complex32::new(0.0, 0.0));
        assert_eq!(cmd.rows(1).len(), 10);
        assert_eq!(cmd.pending_tasks(), 0);
    }

    #[test]
    fn one_failing_node_does_not_stop_the_task() {
        let q1 = quality(2, 0, 3.0);
        let q3 = quality(2, 4, 5.0);
        let s1 = store("/data/sb0.ms", shard(&[], &[100.0], Vec::new(), Some(q1.clone())));
        let s2 = store("/data/sb1.ms", shard(&[], &[101.0], Vec::new(), None));
        let s3 = store("/data/sb2.ms", shard(&[], &[102.0], Vec::new(), Some(q3.clone())));
        let launcher = InProcessLauncher::new()
            .host("node-1", s1)
            .host("node-2", s2)
            .host("node-3", s3);
        let obs = observation(&[
            ("/data/sb0.ms", "node-1"),
            ("/data/sb1.ms", "node-2"),
            ("/data/sb2.ms", "node-3"),
        ]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_quality_tables_task(false);
        cmd.run(true).unwrap();

        assert_eq!(cmd.errors().len(), 1);
        assert!(cmd.errors()[0].contains("node-2"));
        assert!(cmd.errors()[0].contains("/data/sb1.ms"));
        assert!(matches!(cmd.check_errors(), Err(ClusterError::Remote { count: 1, .. })));

        let mut expected = q1.statistics.clone();
        expected.merge(&q3.statistics).unwrap();
        assert_eq!(cmd.statistics(), Some(&expected));
        let mut expected = q1.histograms.clone();
        expected.merge(&q3.histograms).unwrap();
        assert_eq!(cmd.histograms(), Some(&expected));
    }

    #[test]
    fn failed_worker_process_is_reported() {
        let s1 = store("/data/sb0.ms", shard(&[(0, "CS001")], &[100.0], Vec::new(), None));
        let launcher = InProcessLauncher::new().host("node-1", s1).broken("node-2", 255);
        let obs = observation(&[("/data/sb0.ms", "node-1"), ("/data/sb1.ms", "node-2")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_antenna_tables_task();
        cmd.run(false).unwrap();
        assert_eq!(cmd.errors().len(), 1);
        assert!(cmd.errors()[0].contains("node-2"));
        assert!(cmd.errors()[0].contains("exit code 255"));
        assert_eq!(cmd.antennas().len(), 1);

        // The lost host is skipped, with one error, on every later task.
        cmd.push_read_band_tables_task();
        cmd.run(true).unwrap();
        assert_eq!(cmd.errors().len(), 1);
        assert!(cmd.errors()[0].contains("no longer running"));
        assert!(cmd.band(0).is_some());
        assert!(cmd.band(1).is_none());
    }

    #[test]
    fn unanswered_request_drops_the_host() {
        let good = store("/a.ms", shard(&[(0, "CS001")], &[100.0], Vec::new(), None));
        let launcher = InProcessLauncher::new().host("good", good).silent("silent");
        let obs = observation(&[("/a.ms", "good"), ("/b.ms", "silent")]);
        let mut cmd = ProcessCommander::with_launcher(
            obs,
            ClusterSettings { request_timeout_ms: 200, ..settings() },
            Arc::new(launcher),
        );

        cmd.push_read_band_tables_task();
        cmd.run(false).unwrap();
        assert!(cmd.band(0).is_some());
        assert!(cmd.band(1).is_none());
        let timed_out: Vec<&String> = cmd.errors().iter().filter(|e| e.contains("connection failed")).collect();
        assert_eq!(timed_out.len(), 1);
        assert!(timed_out[0].starts_with("silent: /b.ms: "));
        assert!(cmd.errors().iter().all(|e| e.starts_with("silent")));

        cmd.push_read_antenna_tables_task();
        cmd.run(true).unwrap();
        assert!(cmd.errors().iter().any(|e| e == "silent: worker is no longer running"));
        assert!(cmd.errors().iter().all(|e| e.starts_with("silent")));
        assert_eq!(cmd.antennas().len(), 1);
    }

    #[test]
    fn inconsistent_quality_tables_are_fatal_not_a_panic() {
        let mut bad = QualityTables::new(2);
        bad.histograms = serde_json::from_str(r#"{"polarization_count":2,"total":[{}],"rfi":[{}]}"#).unwrap();
        let s1 = store("/data/sb0.ms", shard(&[], &[100.0], Vec::new(), Some(quality(2, 0, 1.0))));
        let s2 = store("/data/sb1.ms", shard(&[], &[101.0], Vec::new(), Some(bad)));
        let launcher = InProcessLauncher::new().host("node-1", s1).host("node-2", s2);
        let obs = observation(&[("/data/sb0.ms", "node-1"), ("/data/sb1.ms", "node-2")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_quality_tables_task(false);
        assert!(matches!(cmd.run(true), Err(ClusterError::Aggregation(_))));
    }

    #[test]
    fn worker_exit_names_the_shard_in_progress() {
        let obs = observation(&[("/d/a.ms", "node-1"), ("/d/b.ms", "node-1"), ("/d/c.ms", "node-2")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(InProcessLauncher::new()));
        cmd.node_map.initialize(&cmd.observation);
        cmd.node_map.pop("node-1");

        cmd.process_finished("node-1".into(), Ok(ExitReport::with_code(2)));
        cmd.process_finished("node-2".into(), Ok(ExitReport::success()));
        assert_eq!(
            cmd.errors().to_vec(),
            vec![
                "node-1: /d/a.ms: worker exited with exit code 2",
                "node-2: worker exited before finishing its work",
            ]
        );
        assert!(cmd.node_map.is_empty());
        assert!(cmd.lost_hosts.contains("node-1"));
    }

    #[test]
    fn listener_failure_keeps_the_task_queued() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();
        let obs = observation(&[("/data/sb0.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(
            obs,
            ClusterSettings { port, ..settings() },
            Arc::new(InProcessLauncher::new()),
        );

        cmd.push_read_band_tables_task();
        assert!(matches!(cmd.run(true), Err(ClusterError::Listener(_))));
        assert_eq!(cmd.pending_tasks(), 1);
        assert!(cmd.local_addr().is_none());
    }

    #[test]
    fn shards_of_one_host_are_visited_in_order() {
        let s = Arc::new(MemoryStore::new());
        s.insert("/d/a.ms", shard(&[], &[100.0], Vec::new(), None));
        s.insert("/d/b.ms", shard(&[], &[101.0], Vec::new(), None));
        s.insert("/d/c.ms", shard(&[], &[102.0], Vec::new(), None));
        let launcher = InProcessLauncher::new().host("node-1", Arc::clone(&s));
        let obs = observation(&[("/d/a.ms", "node-1"), ("/d/b.ms", "node-1"), ("/d/c.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_band_tables_task();
        cmd.run(true).unwrap();
        cmd.check_errors().unwrap();
        assert_eq!(s.requests(), vec!["band /d/a.ms", "band /d/b.ms", "band /d/c.ms"]);
        assert_eq!(cmd.band(2).unwrap().start_frequency(), Some(102.0 * MHZ));
    }

    #[test]
    fn timerange_is_written_back() {
        let s1 = store("/data/sb0.ms", shard(&[], &[100.0, 101.0], rows(0, 4, 2, 1.0), None));
        let launcher = InProcessLauncher::new().host("node-1", Arc::clone(&s1));
        let obs = observation(&[("/data/sb0.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_band_tables_task();
        cmd.run(false).unwrap();
        cmd.initialize_timerange(1, 4).unwrap();
        cmd.push_read_data_rows_task(0, 4).unwrap();
        cmd.run(false).unwrap();

        cmd.timerange_mut().unwrap().set_sample(2, 1, 0, Complex32::new(-7.0, 0.5));
        cmd.push_write_data_rows_task(0, 4).unwrap();
        cmd.run(true).unwrap();
        cmd.check_errors().unwrap();

        let written = s1.shard("/data/sb0.ms").unwrap().rows.unwrap();
        assert_eq!(written[2].sample(1, 0), Complex32::new(-7.0, 0.5));
        assert_eq!(written[2].sample(0, 0), Complex32::new(1.0, 0.0));
        assert_eq!(written[0], rows(0, 4, 2, 1.0)[0]);
    }

    #[test]
    fn merge_mismatch_is_fatal() {
        let s1 = store("/data/sb0.ms", shard(&[], &[100.0], Vec::new(), Some(quality(2, 0, 1.0))));
        let s2 = store("/data/sb1.ms", shard(&[], &[101.0], Vec::new(), Some(quality(4, 0, 1.0))));
        let launcher = InProcessLauncher::new().host("node-1", s1).host("node-2", s2);
        let obs = observation(&[("/data/sb0.ms", "node-1"), ("/data/sb1.ms", "node-2")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(launcher));

        cmd.push_read_quality_tables_task(false);
        cmd.push_read_antenna_tables_task();
        let result = cmd.run(true);
        assert!(matches!(result, Err(ClusterError::Aggregation(_))));
        assert_eq!(cmd.pending_tasks(), 0);
        assert!(cmd.antennas().is_empty());
    }

    #[test]
    fn row_tasks_need_a_timerange() {
        let obs = observation(&[("/data/sb0.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(InProcessLauncher::new()));
        assert!(matches!(cmd.push_read_data_rows_task(0, 10), Err(ClusterError::TimerangeNotInitialized)));
        assert!(matches!(cmd.push_write_data_rows_task(0, 10), Err(ClusterError::TimerangeNotInitialized)));
        assert!(matches!(cmd.initialize_timerange(1, 10), Err(ClusterError::Grid(_))));
    }

    #[test]
    fn run_without_tasks_does_nothing() {
        let obs = observation(&[("/data/sb0.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(obs, settings(), Arc::new(InProcessLauncher::new()));
        cmd.run(true).unwrap();
        assert!(cmd.local_addr().is_none());
        assert!(cmd.errors().is_empty());
    }

    #[test]
    fn error_string_is_capped() {
        let obs = observation(&[("/data/sb0.ms", "node-1")]);
        let mut cmd = ProcessCommander::with_launcher(
            obs,
            ClusterSettings { max_reported_errors: 2, ..settings() },
            Arc::new(InProcessLauncher::new()),
        );
        for i in 0..5 {
            cmd.errors.push(format!("node-{}: failed", i));
        }
        let summary = cmd.error_string();
        assert_eq!(summary.lines().count(), 3);
        assert!(summary.ends_with("... and 3 more"));
    }
}
