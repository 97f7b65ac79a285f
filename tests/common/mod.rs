//! Scripted radio driver double shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::sleep;
use uuid::Uuid;

use ble_session::{CharacteristicHandle, RadioDriver, RadioEvent, Result};

/// Every driver call the session dispatched, in dispatch order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Scan(Vec<Uuid>, bool),
    StopScan,
    Enable,
    Connect(String),
    Disconnect(String),
    Read(CharacteristicHandle),
    Write(CharacteristicHandle, Vec<u8>),
    WriteWithoutResponse(CharacteristicHandle, Vec<u8>),
    StartNotifications(CharacteristicHandle),
    StopNotifications(CharacteristicHandle),
    ReadRssi(String),
}

pub struct MockDriver {
    calls: Mutex<Vec<MockCall>>,
    write_script: Mutex<VecDeque<Result<()>>>,
    read_script: Mutex<VecDeque<Result<Vec<u8>>>>,
    connect_script: Mutex<VecDeque<Result<()>>>,
    /// Artificial latency for reads and writes, to let tests queue work
    /// behind an in-flight operation.
    latency: Mutex<Duration>,
    in_flight: Mutex<HashMap<CharacteristicHandle, usize>>,
    max_in_flight_per_handle: AtomicUsize,
    events: broadcast::Sender<RadioEvent>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        let _ = env_logger::builder().is_test(true).try_init();
        let (events, _) = broadcast::channel(64);
        Arc::new(MockDriver {
            calls: Mutex::new(Vec::new()),
            write_script: Mutex::new(VecDeque::new()),
            read_script: Mutex::new(VecDeque::new()),
            connect_script: Mutex::new(VecDeque::new()),
            latency: Mutex::new(Duration::ZERO),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight_per_handle: AtomicUsize::new(0),
            events,
        })
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Queues per-call write results; once the script runs dry every write
    /// succeeds.
    pub fn script_writes(&self, results: Vec<Result<()>>) {
        self.write_script.lock().unwrap().extend(results);
    }

    pub fn script_reads(&self, results: Vec<Result<Vec<u8>>>) {
        self.read_script.lock().unwrap().extend(results);
    }

    pub fn script_connects(&self, results: Vec<Result<()>>) {
        self.connect_script.lock().unwrap().extend(results);
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<(CharacteristicHandle, Vec<u8>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MockCall::Write(handle, data)
                | MockCall::WriteWithoutResponse(handle, data) => Some((handle, data)),
                _ => None,
            })
            .collect()
    }

    /// Highest number of concurrently in-flight calls observed on any single
    /// characteristic handle.
    pub fn max_in_flight_per_handle(&self) -> usize {
        self.max_in_flight_per_handle.load(Ordering::SeqCst)
    }

    pub fn send_event(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn enter(&self, handle: &CharacteristicHandle) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(handle.clone()).or_insert(0);
        *count += 1;
        self.max_in_flight_per_handle
            .fetch_max(*count, Ordering::SeqCst);
    }

    fn exit(&self, handle: &CharacteristicHandle) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(handle) {
            *count = count.saturating_sub(1);
        }
    }

    async fn pace(&self) {
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            sleep(latency).await;
        }
    }
}

#[async_trait]
impl RadioDriver for MockDriver {
    async fn scan(&self, service_uuids: &[Uuid], allow_duplicates: bool) -> Result<()> {
        self.record(MockCall::Scan(service_uuids.to_vec(), allow_duplicates));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(MockCall::StopScan);
        Ok(())
    }

    async fn enable(&self) -> Result<()> {
        self.record(MockCall::Enable);
        Ok(())
    }

    async fn connect(&self, peripheral_id: &str) -> Result<()> {
        self.record(MockCall::Connect(peripheral_id.to_string()));
        self.connect_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn disconnect(&self, peripheral_id: &str) -> Result<()> {
        self.record(MockCall::Disconnect(peripheral_id.to_string()));
        Ok(())
    }

    async fn read(&self, handle: &CharacteristicHandle) -> Result<Vec<u8>> {
        self.record(MockCall::Read(handle.clone()));
        self.enter(handle);
        self.pace().await;
        let result = self
            .read_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(vec![0x01]));
        self.exit(handle);
        result
    }

    async fn write(&self, handle: &CharacteristicHandle, chunk: &[u8]) -> Result<()> {
        self.record(MockCall::Write(handle.clone(), chunk.to_vec()));
        self.enter(handle);
        self.pace().await;
        let result = self
            .write_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        self.exit(handle);
        result
    }

    async fn write_without_response(
        &self,
        handle: &CharacteristicHandle,
        chunk: &[u8],
    ) -> Result<()> {
        self.record(MockCall::WriteWithoutResponse(handle.clone(), chunk.to_vec()));
        self.enter(handle);
        self.pace().await;
        let result = self
            .write_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()));
        self.exit(handle);
        result
    }

    async fn start_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.record(MockCall::StartNotifications(handle.clone()));
        Ok(())
    }

    async fn stop_notifications(&self, handle: &CharacteristicHandle) -> Result<()> {
        self.record(MockCall::StopNotifications(handle.clone()));
        Ok(())
    }

    async fn read_rssi(&self, peripheral_id: &str) -> Result<i16> {
        self.record(MockCall::ReadRssi(peripheral_id.to_string()));
        Ok(-60)
    }

    fn subscribe_events(&self) -> broadcast::Receiver<RadioEvent> {
        self.events.subscribe()
    }
}
