/// `None`/negative ⇒ infinite; `0` ⇒ no retries; `N>0` ⇒ up to `N` more
/// attempts after failures that originate at link/connection level.
/// Decremented exclusively at link/connection reset time (spec §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    Infinite,
    Remaining(i64),
}

impl Retry {
    pub fn new(n: Option<i64>) -> Self {
        match n {
            None => Retry::Infinite,
            Some(v) if v < 0 => Retry::Infinite,
            Some(v) => Retry::Remaining(v),
        }
    }

    /// Decrements the counter. Returns `true` if the task should now be
    /// failed with retries-exhausted rather than kept pending for resend.
    pub fn decrement_and_check_exhausted(&mut self) -> bool {
        match self {
            Retry::Infinite => false,
            Retry::Remaining(n) => {
                if *n == 0 {
                    true
                } else {
                    *n -= 1;
                    false
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_retries_is_exhausted_on_first_reset() {
        let mut r = Retry::new(Some(0));
        assert!(r.decrement_and_check_exhausted());
    }

    #[test]
    fn n_retries_survives_n_resets_then_fails() {
        let mut r = Retry::new(Some(2));
        assert!(!r.decrement_and_check_exhausted());
        assert!(!r.decrement_and_check_exhausted());
        assert!(r.decrement_and_check_exhausted());
    }

    #[test]
    fn negative_or_none_is_infinite() {
        let mut r = Retry::new(None);
        for _ in 0..1000 {
            assert!(!r.decrement_and_check_exhausted());
        }
        let mut r = Retry::new(Some(-5));
        assert!(!r.decrement_and_check_exhausted());
    }
}
