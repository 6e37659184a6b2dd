use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, error};

use crate::image::SharedImage;
use crate::modbus::{FunctionCode, Transaction, ADU_SIZE};
use crate::semaphore::Semaphore;
use crate::{Error, Result};

/// The default number of concurrently served connections
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Request counters, aggregated across all connections of one server
#[derive(Default)]
pub struct ServerStats {
    runs: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    exceptions: AtomicU64,
}

impl ServerStats {
    /// Requests processed
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }
    /// Read requests processed
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
    /// Write requests processed
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
    /// Requests answered with an exception response
    pub fn exceptions(&self) -> u64 {
        self.exceptions.load(Ordering::Relaxed)
    }
    fn account(&self, txn: &Transaction) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if txn.exception().is_some() {
            self.exceptions.fetch_add(1, Ordering::Relaxed);
        } else if txn.function_code().is_write() {
            self.writes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Modbus/TCP slave. Requires to be run in a separate thread manually (the
/// runtime spawns it as a blocking task).
pub struct ModbusServer {
    listener: TcpListener,
    image: SharedImage,
    stats: Arc<ServerStats>,
    workers: Semaphore,
}

impl ModbusServer {
    /// Binds the listening socket. The conventional address is `0.0.0.0:502`.
    pub fn bind<A: ToSocketAddrs>(addr: A, image: SharedImage) -> Result<Self> {
        Ok(Self {
            listener: TcpListener::bind(addr)?,
            image,
            stats: <_>::default(),
            workers: Semaphore::new(DEFAULT_MAX_CONNECTIONS),
        })
    }
    /// Overrides the connection cap (can be used as a build pattern)
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.workers = Semaphore::new(max);
        self
    }
    /// The bound address (useful when listening on an ephemeral port)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }
    /// The request counters
    pub fn stats(&self) -> Arc<ServerStats> {
        self.stats.clone()
    }
    /// Accepts and serves connections. This function blocks the current
    /// thread; a failing connection terminates its own task only.
    pub fn serve(&self) -> Result<()> {
        loop {
            let permission = self.workers.acquire();
            let (stream, addr) = self.listener.accept()?;
            if let Err(e) = stream.set_nodelay(true) {
                error!(%addr, %e, "error preparing tcp stream");
                continue;
            }
            let image = self.image.clone();
            let stats = self.stats.clone();
            thread::spawn(move || {
                let _permission = permission;
                debug!(%addr, "Modbus client connected");
                if let Err(error) = handle_connection(stream, &image, &stats) {
                    error!(%addr, %error, "error handling Modbus client");
                }
                debug!(%addr, "Modbus client disconnected");
            });
        }
    }
}

/// Serves one connection: accumulates one ADU per iteration as dictated by
/// the MBAP length field, runs the engine under the image lock and writes the
/// reply back. Returns on EOF; read/write errors propagate to the caller.
fn handle_connection(
    mut stream: TcpStream,
    image: &SharedImage,
    stats: &ServerStats,
) -> Result<()> {
    let mut adu = [0u8; ADU_SIZE];
    loop {
        if let Err(e) = stream.read_exact(&mut adu[..7]) {
            return if e.kind() == ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(e.into())
            };
        }
        let protocol_id = u16::from_be_bytes([adu[2], adu[3]]);
        if protocol_id != 0 {
            return Err(Error::invalid_data(format!(
                "unexpected MBAP protocol id {}",
                protocol_id
            )));
        }
        // the length field counts the unit id (already read) plus the PDU
        let length = usize::from(u16::from_be_bytes([adu[4], adu[5]]));
        if length < 2 || length + 6 > ADU_SIZE {
            return Err(Error::invalid_data(format!(
                "unexpected MBAP length {}",
                length
            )));
        }
        stream.read_exact(&mut adu[7..6 + length])?;
        let mut txn = Transaction::new(&adu[..6 + length]);
        if txn.function_code() == FunctionCode::Error {
            debug!(fc = adu[7], "unsupported function code");
        }
        image.with_lock(|img| txn.run(img));
        stats.account(&txn);
        stream.write_all(txn.reply())?;
    }
}

#[cfg(test)]
mod test {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::sync::Arc;
    use std::thread;

    use super::ModbusServer;
    use crate::image::{Family, IoCell, ProcessImage, SharedImage};

    #[test]
    fn test_loopback_exchange() {
        let mut image = ProcessImage::new();
        let cell = Arc::new(IoCell::new(false));
        image.bind(Family::Output, 0, 3, cell.clone()).unwrap();
        let server = ModbusServer::bind("127.0.0.1:0", SharedImage::new(image)).unwrap();
        let addr = server.local_addr().unwrap();
        let stats = server.stats();
        thread::spawn(move || {
            let _ = server.serve();
        });

        let mut stream = TcpStream::connect(addr).unwrap();
        // read coils, none mapped in the first byte but address 3
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x01, 0x00, 0x00, 0x00, 0x08];
        stream.write_all(&request).unwrap();
        let mut reply = [0u8; 10];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(
            reply,
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x04, 0x01, 0x01, 0x01, 0x00]
        );

        // write the mapped coil on, same connection
        let request = [0x00, 0x02, 0x00, 0x00, 0x00, 0x06, 0x01, 0x05, 0x00, 0x03, 0xff, 0x00];
        stream.write_all(&request).unwrap();
        let mut reply = [0u8; 12];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(reply, request);
        assert!(cell.get());
        assert_eq!(stats.runs(), 2);
        assert_eq!(stats.reads(), 1);
        assert_eq!(stats.writes(), 1);
    }
}
