use std::future::Future;
use std::time::Duration;

pub fn piece_size_from_idx(number_of_pieces: u32, total_length: u64, piece_size: usize, idx: u32) -> usize {
    if number_of_pieces.checked_sub(1) == Some(idx) {
        // piece_size fits into usize, so the remainder does too
        let remainder = (total_length % piece_size as u64) as usize;
        if remainder == 0 {
            piece_size
        } else {
            remainder
        }
    } else {
        piece_size
    }
}

pub trait Elapsed<T> {
    fn with_elapsed(
        self,
        name: &'static str,
        threshold: Option<Duration>,
    ) -> impl std::future::Future<Output = T> + Send
    where
        Self: Future<Output = T>;
}

impl<F, T> Elapsed<T> for F
where
    F: Future<Output = T> + Send,
{
    async fn with_elapsed(self, name: &'static str, expected: Option<Duration>) -> T
    where
        Self: Future<Output = T>,
    {
        let start = std::time::Instant::now();
        let result = self.await;

        let elapsed = start.elapsed();
        match expected {
            Some(expected) if elapsed > expected => {
                tracing::debug!(?expected, ?elapsed, "'{}' took more time than expected", name);
            }
            _ => tracing::trace!("'{}' took {:?}", name, elapsed),
        }

        result
    }
}
