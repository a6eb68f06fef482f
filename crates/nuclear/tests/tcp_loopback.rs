//! Scenario 4: bind a TCP listener; on `Startup` connect to it
//! from a second thread and send `"Hello TCP World!"`; the accept reaction
//! reads it back and the two should compare equal.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::num::NonZeroUsize;
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use nuclear::{Configuration, Environment, Interest, PowerPlant, Priority, Reactor, ReactionHandle, Startup};

const PAYLOAD: &str = "Hello TCP World!";

static RECEIVED: OnceLock<Mutex<Option<String>>> = OnceLock::new();

struct Loopback {
    _listener: Arc<TcpListener>,
    _on_accept: ReactionHandle,
    _on_startup: ReactionHandle,
}

impl Reactor for Loopback {
    fn new(env: &Environment) -> Self {
        RECEIVED.get_or_init(|| Mutex::new(None));

        let listener = Arc::new(TcpListener::bind("127.0.0.1:0").expect("bind loopback listener"));
        listener.set_nonblocking(true).expect("set listener nonblocking");
        let port = listener.local_addr().unwrap().port();
        let fd = listener.as_raw_fd();

        let listener_for_accept = Arc::clone(&listener);
        let on_accept = env.on_io(fd, Interest::READ, Priority::NORMAL, move |_event| {
            let Ok((mut stream, _)) = listener_for_accept.accept() else {
                return;
            };
            stream
                .set_nonblocking(false)
                .expect("set accepted stream blocking");

            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while received.len() < PAYLOAD.len() {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
            *RECEIVED.get().unwrap().lock().unwrap() =
                Some(String::from_utf8_lossy(&received).into_owned());
        });

        let on_startup = env.on::<Startup>().then(move || {
            std::thread::spawn(move || {
                let mut stream =
                    TcpStream::connect(("127.0.0.1", port)).expect("connect to loopback listener");
                stream
                    .write_all(PAYLOAD.as_bytes())
                    .expect("write loopback payload");
            });
        });

        Loopback {
            _listener: listener,
            _on_accept: on_accept,
            _on_startup: on_startup,
        }
    }
}

#[test]
fn tcp_loopback_round_trips_the_payload() {
    let plant = PowerPlant::new(Configuration::new(NonZeroUsize::new(2).unwrap())).unwrap();
    plant.install::<Loopback>().unwrap();

    // `start()` blocks until `shutdown()` is called (§4.7), so the
    // shutdown trigger has to come from another thread.
    let shutdown_plant = Arc::clone(&plant);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(300));
        shutdown_plant.shutdown();
    });

    plant.start();

    assert_eq!(
        RECEIVED.get().unwrap().lock().unwrap().as_deref(),
        Some(PAYLOAD),
        "accept reaction did not read back the sent payload"
    );
}
