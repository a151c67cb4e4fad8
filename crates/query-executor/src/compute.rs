//! Compute engine
//!
//! Kernels hand batches and their expression text to a [`ComputeEngine`].
//! [`ArrowComputeEngine`] evaluates the expression subset parsed by
//! [`crate::expression`] with Arrow compute kernels.

use crate::expression::{
    get_condition, get_project_expressions, BinaryOp, Expr, ScalarValue, UnaryOp,
};
use arrow::array::*;
use arrow::compute;
use arrow::compute::kernels::cmp::{eq, gt, gt_eq, lt, lt_eq, neq};
use arrow::compute::kernels::filter::filter_record_batch;
use arrow::compute::kernels::numeric::{add, div, mul, neg, rem, sub};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use query_core::{Context, QueryError, Result};
use std::fmt::Debug;
use std::sync::Arc;

/// Per-batch relational operations used by filter and projection kernels
pub trait ComputeEngine: Debug + Send + Sync {
    /// Keep the rows of `batch` matching the condition in `expression`
    fn apply_filter(&self, batch: &RecordBatch, expression: &str, context: &Context)
        -> Result<RecordBatch>;

    /// Evaluate the projection list in `expression` over `batch`
    fn apply_projection(
        &self,
        batch: RecordBatch,
        expression: &str,
        context: &Context,
    ) -> Result<RecordBatch>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ArrowComputeEngine;

impl ArrowComputeEngine {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeEngine for ArrowComputeEngine {
    fn apply_filter(
        &self,
        batch: &RecordBatch,
        expression: &str,
        _context: &Context,
    ) -> Result<RecordBatch> {
        let predicate = Expr::parse(&get_condition(expression)?)?;
        filter_batch(batch, &predicate)
    }

    fn apply_projection(
        &self,
        batch: RecordBatch,
        expression: &str,
        _context: &Context,
    ) -> Result<RecordBatch> {
        let items = get_project_expressions(expression)?;
        if items.is_empty() {
            return Err(QueryError::ExpressionError(format!(
                "empty projection list in '{}'",
                expression
            )));
        }

        let mut fields = Vec::with_capacity(items.len());
        let mut columns = Vec::with_capacity(items.len());
        for (name, text) in items {
            let expr = Expr::parse(&text)?;
            let array = evaluate_expr(&expr, &batch)?;
            let nullable = match &expr {
                Expr::Column(index) => batch.schema().field(*index).is_nullable(),
                _ => true,
            };
            fields.push(Field::new(name, array.data_type().clone(), nullable));
            columns.push(array);
        }

        let schema = Arc::new(Schema::new(fields));
        Ok(RecordBatch::try_new(schema, columns)?)
    }
}

/// Keep the rows for which `predicate` is true; nulls count as false
pub fn filter_batch(batch: &RecordBatch, predicate: &Expr) -> Result<RecordBatch> {
    let mask = evaluate_expr(predicate, batch)?;
    let mask = mask.as_any().downcast_ref::<BooleanArray>().ok_or_else(|| {
        QueryError::ExpressionError(format!(
            "filter predicate must return boolean, got {}",
            mask.data_type()
        ))
    })?;
    Ok(filter_record_batch(batch, mask)?)
}

pub fn evaluate_expr(expr: &Expr, batch: &RecordBatch) -> Result<ArrayRef> {
    match expr {
        Expr::Column(index) => {
            if *index >= batch.num_columns() {
                return Err(QueryError::ExpressionError(format!(
                    "Column index {} out of bounds for {} columns",
                    index,
                    batch.num_columns()
                )));
            }
            Ok(batch.column(*index).clone())
        }
        Expr::Literal(value) => Ok(literal_array(value, batch.num_rows())),
        Expr::Binary { left, op, right } => {
            let left_array = evaluate_expr(left, batch)?;
            let right_array = evaluate_expr(right, batch)?;
            let (l, r) = coerce(left_array, left.is_literal(), right_array, right.is_literal())?;
            evaluate_binary_op(&l, *op, &r)
        }
        Expr::Unary { op, expr } => {
            let array = evaluate_expr(expr, batch)?;
            evaluate_unary_op(&array, *op)
        }
    }
}

fn literal_array(value: &ScalarValue, size: usize) -> ArrayRef {
    match value {
        ScalarValue::Boolean(v) => Arc::new(BooleanArray::from(vec![*v; size])) as ArrayRef,
        ScalarValue::Int64(v) => Arc::new(Int64Array::from(vec![*v; size])) as ArrayRef,
        ScalarValue::Float64(v) => Arc::new(Float64Array::from(vec![*v; size])) as ArrayRef,
        ScalarValue::Utf8(s) => Arc::new(StringArray::from(vec![s.as_str(); size])) as ArrayRef,
        ScalarValue::Null => Arc::new(NullArray::new(size)) as ArrayRef,
    }
}

fn is_float(data_type: &DataType) -> bool {
    matches!(
        data_type,
        DataType::Float16 | DataType::Float32 | DataType::Float64
    )
}

/// Bring both operands to one type.
///
/// A literal takes the type of the other side unless that would truncate a
/// float literal into an integer column; mixed numeric columns widen to
/// Float64 or Int64.
fn coerce(
    left: ArrayRef,
    left_literal: bool,
    right: ArrayRef,
    right_literal: bool,
) -> Result<(ArrayRef, ArrayRef)> {
    let left_type = left.data_type().clone();
    let right_type = right.data_type().clone();
    if left_type == right_type {
        return Ok((left, right));
    }
    if left_type == DataType::Null {
        return Ok((compute::cast(&left, &right_type)?, right));
    }
    if right_type == DataType::Null {
        return Ok((left, compute::cast(&right, &left_type)?));
    }

    let numeric = left_type.is_numeric() && right_type.is_numeric();
    if numeric && is_float(&left_type) != is_float(&right_type) {
        let target = DataType::Float64;
        return Ok((compute::cast(&left, &target)?, compute::cast(&right, &target)?));
    }
    if right_literal {
        return Ok((left, compute::cast(&right, &left_type)?));
    }
    if left_literal {
        return Ok((compute::cast(&left, &right_type)?, right));
    }
    if numeric {
        let target = if is_float(&left_type) {
            DataType::Float64
        } else {
            DataType::Int64
        };
        return Ok((compute::cast(&left, &target)?, compute::cast(&right, &target)?));
    }
    Err(QueryError::ExpressionError(format!(
        "Type mismatch: {} vs {}",
        left_type, right_type
    )))
}

fn as_boolean<'a>(array: &'a ArrayRef, op: &str) -> Result<&'a BooleanArray> {
    array
        .as_any()
        .downcast_ref::<BooleanArray>()
        .ok_or_else(|| QueryError::ExpressionError(format!("{} requires boolean arrays", op)))
}

fn evaluate_unary_op(array: &ArrayRef, op: UnaryOp) -> Result<ArrayRef> {
    match op {
        UnaryOp::Not => Ok(Arc::new(compute::not(as_boolean(array, "NOT")?)?) as ArrayRef),
        UnaryOp::Minus => Ok(neg(array)?),
        UnaryOp::IsNull => Ok(Arc::new(compute::is_null(array)?) as ArrayRef),
        UnaryOp::IsNotNull => Ok(Arc::new(compute::is_not_null(array)?) as ArrayRef),
    }
}

fn evaluate_binary_op(left: &ArrayRef, op: BinaryOp, right: &ArrayRef) -> Result<ArrayRef> {
    let result: ArrayRef = match op {
        BinaryOp::Add => add(left, right)?,
        BinaryOp::Subtract => sub(left, right)?,
        BinaryOp::Multiply => mul(left, right)?,
        BinaryOp::Divide => div(left, right)?,
        BinaryOp::Modulo => rem(left, right)?,
        BinaryOp::Equal => Arc::new(eq(left, right)?),
        BinaryOp::NotEqual => Arc::new(neq(left, right)?),
        BinaryOp::Less => Arc::new(lt(left, right)?),
        BinaryOp::LessEqual => Arc::new(lt_eq(left, right)?),
        BinaryOp::Greater => Arc::new(gt(left, right)?),
        BinaryOp::GreaterEqual => Arc::new(gt_eq(left, right)?),
        BinaryOp::And => Arc::new(compute::and(
            as_boolean(left, "AND")?,
            as_boolean(right, "AND")?,
        )?),
        BinaryOp::Or => Arc::new(compute::or(
            as_boolean(left, "OR")?,
            as_boolean(right, "OR")?,
        )?),
    };
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
            Field::new("score", DataType::Float64, true),
            Field::new("qty", DataType::Int32, false),
        ]));
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4, 5])),
                Arc::new(StringArray::from(vec![
                    Some("a"),
                    Some("b"),
                    None,
                    Some("a"),
                    Some("c"),
                ])),
                Arc::new(Float64Array::from(vec![
                    Some(1.5),
                    Some(2.5),
                    Some(3.5),
                    None,
                    Some(5.5),
                ])),
                Arc::new(Int32Array::from(vec![10, 20, 30, 40, 50])),
            ],
        )
        .unwrap()
    }

    fn ids(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    fn filter(expression: &str) -> Result<RecordBatch> {
        ArrowComputeEngine::new().apply_filter(
            &create_test_batch(),
            expression,
            &Context::local(1),
        )
    }

    #[test]
    fn test_filter_comparison() {
        let out = filter("LogicalFilter(condition=[>($0, 2)])").unwrap();
        assert_eq!(ids(&out), vec![3, 4, 5]);
    }

    #[test]
    fn test_filter_boolean_logic_and_strings() {
        let out = filter("LogicalFilter(condition=[OR(=($1, 'a'), AND(>=($0, 5), NOT(=($1, 'x'))))])")
            .unwrap();
        assert_eq!(ids(&out), vec![1, 4, 5]);
    }

    #[test]
    fn test_filter_literal_cast_to_column_type() {
        let out = filter("LogicalFilter(condition=[<($3, 25)])").unwrap();
        assert_eq!(ids(&out), vec![1, 2]);

        let out = filter("LogicalFilter(condition=[>($0, 2.5)])").unwrap();
        assert_eq!(ids(&out), vec![3, 4, 5]);
    }

    #[test]
    fn test_filter_nulls() {
        let out = filter("LogicalFilter(condition=[IS NULL($2)])").unwrap();
        assert_eq!(ids(&out), vec![4]);
        let out = filter("LogicalFilter(condition=[>($2, 2.0)])").unwrap();
        assert_eq!(ids(&out), vec![2, 3, 5]);
    }

    #[test]
    fn test_filter_from_scan_expression() {
        let out = filter("BindableTableScan(table=[[main, t]], filters=[[<=($0, 2)]])").unwrap();
        assert_eq!(ids(&out), vec![1, 2]);
    }

    #[test]
    fn test_filter_errors() {
        assert!(matches!(
            filter("LogicalFilter(condition=[+($0, 1)])"),
            Err(QueryError::ExpressionError(_))
        ));
        assert!(filter("LogicalFilter(condition=[>($9, 1)])").is_err());
        assert!(filter("LogicalFilter(condition=[=($0, $1)])").is_err());
    }

    #[test]
    fn test_projection() {
        let out = ArrowComputeEngine::new()
            .apply_projection(
                create_test_batch(),
                "LogicalProject(id=[$0], doubled=[*($3, 2)], mixed=[+($0, $3)], neg=[-($0)])",
                &Context::local(1),
            )
            .unwrap();

        assert_eq!(out.num_columns(), 4);
        assert_eq!(out.schema().field(0).name(), "id");
        assert!(!out.schema().field(0).is_nullable());
        assert_eq!(out.schema().field(1).name(), "doubled");
        assert_eq!(out.column(1).data_type(), &DataType::Int32);
        assert_eq!(out.column(2).data_type(), &DataType::Int64);

        let doubled = out.column(1).as_any().downcast_ref::<Int32Array>().unwrap();
        assert_eq!(doubled.value(4), 100);
        let mixed = out.column(2).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(mixed.value(0), 11);
        let neg = out.column(3).as_any().downcast_ref::<Int64Array>().unwrap();
        assert_eq!(neg.value(1), -2);
    }

    #[test]
    fn test_projection_of_literal() {
        let out = ArrowComputeEngine::new()
            .apply_projection(
                create_test_batch(),
                "LogicalProject(tag=['x'])",
                &Context::local(1),
            )
            .unwrap();
        assert_eq!(out.num_rows(), 5);
        assert_eq!(out.column(0).data_type(), &DataType::Utf8);
    }
}
