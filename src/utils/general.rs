use std::cmp::PartialOrd;

//////////////////
// VECTOR STUFF //
//////////////////

/// Get the maximum and minimum value of an array
///
/// ### Params
///
/// * `arr` - The array of values. Must not be empty.
///
/// ### Returns
///
/// Tuple of values with the first being the minimum and the second the maximum
pub fn array_max_min<T: PartialOrd + Copy>(arr: &[T]) -> (T, T) {
    let mut min_val = arr[0];
    let mut max_val = arr[0];
    for number in arr {
        if *number < min_val {
            min_val = *number
        }
        if *number > max_val {
            max_val = *number
        }
    }

    (min_val, max_val)
}

/// Count the `true` values in a boolean slice
pub fn count_true(x: &[bool]) -> usize {
    x.iter().filter(|&&v| v).count()
}
