//! Collectives of the thread-backed group: results, mismatch detection,
//! and abort.

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use crate::coordination::{CoordError, CoordinationGroup, LocalGroup, SoloGroup};

    #[test]
    fn collectives_return_consistent_results() {
        let handles: Vec<_> = LocalGroup::create(3)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let rank = g.rank() as u64;
                    let sum = g.all_reduce_sum(rank + 1).unwrap();
                    let gathered = g.gather(rank * 10, 0).unwrap();
                    let values: Option<Vec<u64>> =
                        gathered.as_ref().map(|v| v.iter().map(|x| x + 1).collect());
                    let scattered = g.scatter(values.as_deref(), 0).unwrap();
                    g.barrier().unwrap();
                    (sum, gathered, scattered)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results[0], (6, Some(vec![0, 10, 20]), 1));
        assert_eq!(results[1], (6, None, 11));
        assert_eq!(results[2], (6, None, 21));
    }

    #[test]
    fn gather_at_non_zero_root() {
        let handles: Vec<_> = LocalGroup::create(2)
            .into_iter()
            .map(|g| thread::spawn(move || g.gather(g.rank() as u64, 1).unwrap()))
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results, [None, Some(vec![0, 1])]);
    }

    #[test]
    fn mismatched_collectives_fail_on_every_rank() {
        let handles: Vec<_> = LocalGroup::create(2)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    if g.rank() == 0 {
                        g.barrier().map(|_| 0)
                    } else {
                        g.all_reduce_sum(5)
                    }
                })
            })
            .collect();

        for handle in handles {
            let err = handle.join().unwrap().unwrap_err();
            assert!(matches!(err, CoordError::ProtocolViolation(_)), "{err:?}");
        }
    }

    #[test]
    fn abort_wakes_blocked_ranks() {
        let mut members = LocalGroup::create(3);
        let aborter = members.pop().unwrap();
        let handles: Vec<_> = members
            .into_iter()
            .map(|g| thread::spawn(move || g.barrier()))
            .collect();

        thread::sleep(Duration::from_millis(50));
        aborter.abort();

        for handle in handles {
            assert_eq!(handle.join().unwrap(), Err(CoordError::Aborted));
        }
        assert_eq!(aborter.barrier(), Err(CoordError::Aborted));
    }

    #[test]
    fn bad_root_and_short_scatter_are_rejected() {
        let members = LocalGroup::create(1);
        assert!(matches!(
            members[0].gather(1, 1),
            Err(CoordError::InvalidArgument(_))
        ));
        assert!(matches!(
            members[0].scatter(Some(&[][..]), 0),
            Err(CoordError::InvalidArgument(_))
        ));
        assert_eq!(members[0].scatter(Some(&[4][..]), 0), Ok(4));

        assert!(SoloGroup.gather(1, 2).is_err());
        assert!(SoloGroup.scatter(None, 0).is_err());
        assert_eq!(SoloGroup.all_reduce_sum(9), Ok(9));
    }

    #[test]
    fn group_survives_many_rounds() {
        let handles: Vec<_> = LocalGroup::create(4)
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let mut total = 0;
                    for round in 0..200u64 {
                        total += g.all_reduce_sum(round).unwrap();
                    }
                    total
                })
            })
            .collect();
        let expected: u64 = (0..200u64).map(|r| 4 * r).sum();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), expected);
        }
    }
}
