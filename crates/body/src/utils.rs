/// Returns early with `$error` when `$predicate` does not hold.
///
/// ```ignore
/// ensure!(self.reserved > 0, BodyError::illegal_state("subscribe without reservation"));
/// ```
macro_rules! ensure {
    ($predicate:expr, $error:expr) => {
        if !$predicate {
            return Err($error);
        }
    };
}

pub(crate) use ensure;
