//! Evaluation order of formula parameters.
//!
//! Formula parameters may depend on other formula parameters. They are
//! evaluated after all free and fixed parameters, in an order where every
//! formula comes after the formulas it reads.

use super::fit_parameter::FitParameter;
use crate::error::{FitError, Result};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn shares_dataset(a: &FitParameter, b: &FitParameter) -> bool {
    match (a.dataset, b.dataset) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

/// Returns the positions in `params` of the formula parameters, sorted so
/// that each formula comes after the formulas it depends on.
///
/// Formulas must have been initialized (compiled) beforehand.
///
/// # Errors
///
/// Returns [`FitError::Structural`] naming the parameters of a dependency
/// cycle, including a formula referring to itself.
pub fn formula_order(params: &[FitParameter], names: &[String]) -> Result<Vec<usize>> {
    let formulas: Vec<usize> = (0..params.len())
        .filter(|&i| params[i].is_formula())
        .collect();

    let mut marks = vec![Mark::Unvisited; params.len()];
    let mut order = Vec::with_capacity(formulas.len());
    let mut path = Vec::new();

    for &start in &formulas {
        visit(start, params, &formulas, &mut marks, &mut order, &mut path, names)?;
    }
    Ok(order)
}

fn visit(
    node: usize,
    params: &[FitParameter],
    formulas: &[usize],
    marks: &mut [Mark],
    order: &mut Vec<usize>,
    path: &mut Vec<usize>,
    names: &[String],
) -> Result<()> {
    match marks[node] {
        Mark::Done => return Ok(()),
        Mark::InProgress => {
            let begin = path.iter().position(|&p| p == node).unwrap_or(0);
            let mut cycle: Vec<&str> = path[begin..]
                .iter()
                .map(|&p| name_of(params[p].index, names))
                .collect();
            cycle.push(name_of(params[node].index, names));
            return Err(FitError::Structural(format!(
                "circular dependency between formula parameters: {}",
                cycle.join(" -> ")
            )));
        }
        Mark::Unvisited => {}
    }

    marks[node] = Mark::InProgress;
    path.push(node);
    let param = &params[node];
    for &dep in param.dependencies() {
        for &other in formulas {
            if params[other].index == dep && shares_dataset(param, &params[other]) {
                visit(other, params, formulas, marks, order, path, names)?;
            }
        }
    }
    path.pop();
    marks[node] = Mark::Done;
    order.push(node);
    Ok(())
}

fn name_of(index: usize, names: &[String]) -> &str {
    names.get(index).map(String::as_str).unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::expression::ExpressionCompiler;

    fn setup(formulas: &[(usize, Option<usize>, &str)], names: &[&str]) -> (Vec<FitParameter>, Vec<String>) {
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut params: Vec<FitParameter> = formulas
            .iter()
            .map(|&(i, ds, e)| FitParameter::formula(i, ds, e))
            .collect();
        params.insert(0, FitParameter::free(0, None));
        for p in &mut params {
            p.initialize(&names, &ExpressionCompiler).unwrap();
        }
        (params, names)
    }

    #[test]
    fn test_chain_is_ordered() {
        // c = b * 2 is listed before b = a + 1
        let (params, names) = setup(&[(2, None, "b * 2"), (1, None, "a + 1")], &["a", "b", "c"]);
        let order = formula_order(&params, &names).unwrap();
        assert_eq!(order, vec![2, 1]);
    }

    #[test]
    fn test_cycle_detected() {
        let (params, names) = setup(&[(1, None, "c + 1"), (2, None, "b * 2")], &["a", "b", "c"]);
        let err = formula_order(&params, &names).unwrap_err();
        assert!(err.is_structural());
        let msg = err.to_string();
        assert!(msg.contains("b") && msg.contains("c"));
    }

    #[test]
    fn test_self_reference() {
        let (params, names) = setup(&[(1, None, "b + a")], &["a", "b"]);
        assert!(formula_order(&params, &names).is_err());
    }

    #[test]
    fn test_different_datasets_do_not_link() {
        // b depends on c only within the same dataset
        let (params, names) = setup(
            &[(1, Some(0), "c + 1"), (2, Some(1), "b * 2")],
            &["a", "b", "c"],
        );
        assert_eq!(formula_order(&params, &names).unwrap().len(), 2);
    }
}
