//! Pool lifecycle and concurrency tests over a mock connection factory.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode, Version};
use url::Url;

use wirepool::{
    ByteStream, Connection, ConnectionFactory, ConnectionPool, ConnectionState, Origin, Request,
    RequestBody, Response, ResponseHead, Result, TimeoutConfig,
};

struct MockConnection {
    origin: Origin,
    state: Mutex<ConnectionState>,
    keep_alive: bool,
    fail_stream_close: bool,
    dropped: AtomicBool,
    close_calls: AtomicUsize,
    stream_close_calls: AtomicUsize,
    in_flight: AtomicUsize,
    overlap: Arc<AtomicBool>,
}

impl Connection for MockConnection {
    fn origin(&self) -> &Origin {
        &self.origin
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock().expect("mock state lock")
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().expect("mock state lock") = state;
    }

    fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::SeqCst)
    }

    fn request(self: Arc<Self>, _request: Request) -> Result<(ResponseHead, Box<dyn ByteStream>)> {
        if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            // A single-stream connection must never serve two exchanges at once.
            self.overlap.store(true, Ordering::SeqCst);
        }
        let head = ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            reason: Some(Bytes::from_static(b"OK")),
            headers: HeaderMap::new(),
        };
        let stream = MockStream {
            conn: self.clone(),
            chunks: VecDeque::from(vec![
                Bytes::from_static(b"hello"),
                Bytes::from_static(b" world"),
            ]),
        };
        Ok((head, Box::new(stream)))
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.set_state(ConnectionState::Closed);
        Ok(())
    }
}

struct MockStream {
    conn: Arc<MockConnection>,
    chunks: VecDeque<Bytes>,
}

impl ByteStream for MockStream {
    fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        Ok(self.chunks.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.conn.stream_close_calls.fetch_add(1, Ordering::SeqCst);
        self.conn.in_flight.fetch_sub(1, Ordering::SeqCst);
        // The engine decides the post-response state.
        if self.conn.keep_alive && !self.conn.fail_stream_close {
            self.conn.set_state(ConnectionState::Idle);
        } else {
            self.conn.set_state(ConnectionState::Closed);
        }
        if self.conn.fail_stream_close {
            return Err(wirepool::error::close("mock stream close failure"));
        }
        Ok(())
    }
}

struct MockFactory {
    keep_alive: bool,
    fail_stream_close: bool,
    created: Mutex<Vec<Arc<MockConnection>>>,
    overlap: Arc<AtomicBool>,
}

impl MockFactory {
    fn new(keep_alive: bool) -> Self {
        Self {
            keep_alive,
            fail_stream_close: false,
            created: Mutex::new(Vec::new()),
            overlap: Arc::new(AtomicBool::new(false)),
        }
    }

    fn failing_close() -> Self {
        Self {
            fail_stream_close: true,
            ..Self::new(false)
        }
    }

    fn created_count(&self) -> usize {
        self.created.lock().expect("created lock").len()
    }

    fn connection(&self, index: usize) -> Arc<MockConnection> {
        self.created.lock().expect("created lock")[index].clone()
    }
}

impl ConnectionFactory for MockFactory {
    fn connect(&self, origin: &Origin, _timeout: &TimeoutConfig) -> Result<Arc<dyn Connection>> {
        let connection = Arc::new(MockConnection {
            origin: origin.clone(),
            state: Mutex::new(ConnectionState::Active),
            keep_alive: self.keep_alive,
            fail_stream_close: self.fail_stream_close,
            dropped: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
            stream_close_calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            overlap: self.overlap.clone(),
        });
        self.created
            .lock()
            .expect("created lock")
            .push(connection.clone());
        Ok(connection)
    }
}

fn get(pool: &ConnectionPool, url: &str) -> Response {
    pool.request(
        Method::GET,
        Url::parse(url).expect("test url"),
        HeaderMap::new(),
        RequestBody::Empty,
        TimeoutConfig::default(),
    )
    .expect("request succeeds")
}

#[test]
fn forwards_chunks_unchanged() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://a.example/");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.reason(), Some(&b"OK"[..]));
    let body = response.body_mut().bytes().expect("body drains");
    assert_eq!(&body[..], b"hello world");
}

#[test]
fn reuses_idle_connection_after_response_close() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://a.example/first");
    response.body_mut().bytes().expect("body drains");
    assert_eq!(factory.connection(0).state(), ConnectionState::Idle);

    let mut response = get(&pool, "http://a.example/second");
    assert_eq!(factory.created_count(), 1);
    assert_eq!(factory.connection(0).state(), ConnectionState::Active);
    response.body_mut().close().expect("close");
}

#[test]
fn closed_connection_is_released_not_reused() {
    let factory = Arc::new(MockFactory::new(false));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://a.example/");
    response.body_mut().bytes().expect("body drains");
    assert_eq!(factory.connection(0).state(), ConnectionState::Closed);

    let mut response = get(&pool, "http://a.example/");
    assert_eq!(factory.created_count(), 2);
    response.body_mut().close().expect("close");
}

#[test]
fn dropped_idle_connection_is_evicted() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://c.example/");
    response.body_mut().bytes().expect("body drains");
    factory.connection(0).dropped.store(true, Ordering::SeqCst);

    let mut response = get(&pool, "http://c.example/");
    assert_eq!(factory.created_count(), 2);
    assert_eq!(factory.connection(0).close_calls.load(Ordering::SeqCst), 1);
    response.body_mut().close().expect("close");

    // The evicted connection never comes back.
    let mut response = get(&pool, "http://c.example/");
    assert_eq!(factory.created_count(), 2);
    response.body_mut().close().expect("close");
}

#[test]
fn active_connection_is_never_shared() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut first = get(&pool, "http://b.example/");
    let mut second = get(&pool, "http://b.example/");
    assert_eq!(factory.created_count(), 2);
    assert!(!Arc::ptr_eq(
        &factory.connection(0),
        &factory.connection(1)
    ));

    first.body_mut().close().expect("close");
    second.body_mut().close().expect("close");

    // Both are idle again; no third connection is needed.
    let mut third = get(&pool, "http://b.example/");
    assert_eq!(factory.created_count(), 2);
    third.body_mut().close().expect("close");
}

#[test]
fn most_recently_pooled_idle_connection_wins() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut first = get(&pool, "http://b.example/");
    let mut second = get(&pool, "http://b.example/");
    first.body_mut().close().expect("close");
    second.body_mut().close().expect("close");

    let mut third = get(&pool, "http://b.example/");
    assert_eq!(factory.created_count(), 2);
    assert_eq!(factory.connection(1).state(), ConnectionState::Active);
    assert_eq!(factory.connection(0).state(), ConnectionState::Idle);
    third.body_mut().close().expect("close");
}

#[test]
fn distinct_origins_use_distinct_connections() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut a = get(&pool, "http://a.example/");
    a.body_mut().bytes().expect("body drains");
    let mut b = get(&pool, "https://a.example/");
    b.body_mut().bytes().expect("body drains");
    let mut c = get(&pool, "http://a.example:8080/");
    c.body_mut().bytes().expect("body drains");

    assert_eq!(factory.created_count(), 3);

    // Same origin as the first request; reused, not recreated.
    let mut again = get(&pool, "http://a.example/other/path");
    assert_eq!(factory.created_count(), 3);
    again.body_mut().close().expect("close");
}

#[test]
fn pool_close_closes_everything_once_and_is_idempotent() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    for url in ["http://a.example/", "http://b.example/", "http://c.example/"] {
        let mut response = get(&pool, url);
        response.body_mut().bytes().expect("body drains");
    }
    assert_eq!(factory.created_count(), 3);

    pool.close();
    for index in 0..3 {
        assert_eq!(
            factory.connection(index).close_calls.load(Ordering::SeqCst),
            1
        );
        assert_eq!(factory.connection(index).state(), ConnectionState::Closed);
    }

    pool.close();
    for index in 0..3 {
        assert_eq!(
            factory.connection(index).close_calls.load(Ordering::SeqCst),
            1
        );
    }
}

#[test]
fn wrapper_close_is_one_shot() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://a.example/");
    response.body_mut().close().expect("first close");
    response.body_mut().close().expect("second close is a no-op");
    drop(response);

    assert_eq!(
        factory.connection(0).stream_close_calls.load(Ordering::SeqCst),
        1
    );
}

#[test]
fn release_fires_even_when_stream_close_fails() {
    let factory = Arc::new(MockFactory::failing_close());
    let pool = ConnectionPool::with_factory(factory.clone());

    let mut response = get(&pool, "http://a.example/");
    let err = response.body_mut().close().expect_err("close surfaces the failure");
    assert!(err.is_close());
    assert_eq!(factory.connection(0).state(), ConnectionState::Closed);

    // The failed connection was still released from the mapping: the next
    // request builds a fresh one instead of tripping over the corpse.
    let mut response = get(&pool, "http://a.example/");
    assert_eq!(factory.created_count(), 2);
    let err = response.body_mut().bytes().expect_err("close failure again");
    assert!(err.is_close());
}

#[test]
fn dropping_a_response_reclaims_the_connection() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    {
        let _response = get(&pool, "http://a.example/");
    }
    assert_eq!(factory.connection(0).state(), ConnectionState::Idle);
    assert_eq!(
        factory.connection(0).stream_close_calls.load(Ordering::SeqCst),
        1
    );

    let mut response = get(&pool, "http://a.example/");
    assert_eq!(factory.created_count(), 1);
    response.body_mut().close().expect("close");
}

#[test]
fn concurrent_callers_never_share_a_connection() {
    let factory = Arc::new(MockFactory::new(true));
    let pool = ConnectionPool::with_factory(factory.clone());

    thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..25 {
                    let mut response = get(&pool, "http://soak.example/work");
                    let body = response.body_mut().bytes().expect("body drains");
                    assert_eq!(&body[..], b"hello world");
                }
            });
        }
    });

    assert!(!factory.overlap.load(Ordering::SeqCst));
    // Never more connections than the peak number of concurrent callers.
    assert!(factory.created_count() <= 8);

    pool.close();
    for index in 0..factory.created_count() {
        assert_eq!(factory.connection(index).state(), ConnectionState::Closed);
    }
}
