//! Contracts the pool needs from pooled services and their factory

/// A service owning some external resource
///
/// The pool calls [`close`](StatefulService::close) at most once per
/// instance, on the eviction path, after the instance has left the pool.
pub trait StatefulService: Send + Sync + 'static {
    fn close(&self);
}

/// Constructs a fresh service for a key the pool has not seen yet
///
/// Any `Fn(&K) -> S` closure is a factory.
///
/// # Examples
///
/// ```
/// use esox_servicepool::{ServiceFactory, StatefulService};
///
/// struct Conn(String);
///
/// impl StatefulService for Conn {
///     fn close(&self) {}
/// }
///
/// let factory = |addr: &str| Conn(addr.to_string());
/// let conn: Conn = factory.create("db:5432");
/// assert_eq!(conn.0, "db:5432");
/// ```
pub trait ServiceFactory<K: ?Sized, S>: Send + Sync {
    fn create(&self, key: &K) -> S;
}

impl<K, S, F> ServiceFactory<K, S> for F
where
    K: ?Sized,
    F: Fn(&K) -> S + Send + Sync,
{
    fn create(&self, key: &K) -> S {
        self(key)
    }
}
