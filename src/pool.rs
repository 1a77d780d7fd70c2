use std::collections::VecDeque;
use std::sync::Mutex;
use std::thread;

/// Runs `task` over `items` on a bounded pool of OS threads. Results are
/// collected in completion order, not submission order; callers must not
/// rely on any correspondence between input and output positions. Blocking
/// calls inside a task stall only that worker.
pub fn run_parallel<T, R, F>(workers: usize, items: Vec<T>, task: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = workers.clamp(1, total);
    let queue = Mutex::new(VecDeque::from(items));
    let results = Mutex::new(Vec::with_capacity(total));

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| {
                loop {
                    let item = queue.lock().unwrap().pop_front();
                    let Some(item) = item else {
                        break;
                    };
                    let outcome = task(item);
                    results.lock().unwrap().push(outcome);
                }
            });
        }
    });

    results.into_inner().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processes_every_item() {
        let items: Vec<u64> = (0..100).collect();
        let mut doubled = run_parallel(8, items, |n| n * 2);
        doubled.sort_unstable();
        let expected: Vec<u64> = (0..100).map(|n| n * 2).collect();
        assert_eq!(doubled, expected);
    }

    #[test]
    fn single_worker_preserves_order() {
        let items = vec!["a", "b", "c"];
        let out = run_parallel(1, items, |s| s.to_string());
        assert_eq!(out, vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let out: Vec<u8> = run_parallel(4, Vec::<u8>::new(), |b| b);
        assert!(out.is_empty());
    }
}
