/// Split `items` into those that stay in front and those that go last,
/// preserving the relative order inside each group.
pub fn stable_partition<T>(items: Vec<T>, mut goes_last: impl FnMut(&T) -> bool) -> Vec<T> {
    let (last, mut front): (Vec<T>, Vec<T>) = items.into_iter().partition(|item| goes_last(item));
    front.extend(last);
    front
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_order_within_groups() {
        let ordered = stable_partition(vec![1, 2, 3, 4, 5, 6], |n| n % 2 == 0);
        assert_eq!(ordered, vec![1, 3, 5, 2, 4, 6]);
    }

    #[test]
    fn nothing_to_move() {
        let ordered = stable_partition(vec!["a", "b"], |_| false);
        assert_eq!(ordered, vec!["a", "b"]);
    }
}
